//! Autonomic Core
//!
//! The Audit → Refine → Evaluate → Deploy control loop for conversational
//! agents.
//!
//! # Core Concepts
//!
//! - [`EpisodeTracker`]: Single writer of remediation episodes; enforces at
//!   most one open episode per agent
//! - [`LoopCoordinator`]: Routes jobs to the stage handlers and applies their
//!   results as compare-and-set transitions
//! - [`VersionStore`]: Append-only configuration history with optimistic
//!   concurrency
//! - [`Channel`]: At-least-once job transport between stages
//! - [`WorkerPool`]: Tasks that pull deliveries and settle them
//!
//! # Example
//!
//! ```rust,ignore
//! use autonomic_core::{EpisodeTracker, LoopConfig, LoopCoordinator, WorkerPool};
//!
//! let coordinator = Arc::new(LoopCoordinator::new(config, Arc::new(EpisodeTracker::new()), ports));
//! let pool = WorkerPool::spawn(Arc::clone(&coordinator));
//!
//! coordinator.submit_audit(agent_id, transcript_ref).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod channel;
mod config;
mod coordinator;
mod episode;
mod error;
pub mod provider;
pub mod stages;
mod store;
mod telemetry;
mod tracker;
mod transcripts;
mod types;
mod worker;

pub use channel::{Channel, Delivery, InMemoryChannel, DEFAULT_PUBLISH_LOG};
pub use config::{ConfigError, LoopConfig, Topics};
pub use coordinator::{AckReason, Disposition, LoopCoordinator, LoopPorts};
pub use episode::{allowed_transitions, validate_transition, Episode, OpenRequest, VerdictRecord};
pub use error::{
    ChannelError, LoopError, ProviderError, StoreError, TrackerError, TranscriptError,
};
pub use provider::{HttpCapabilityProvider, HttpProviderConfig, Judge, ProviderResponse, Providers, Refiner, Scorer};
pub use store::{InMemoryVersionStore, VersionStore};
pub use telemetry::{LoopEvent, MetricsTelemetry, RecordingTelemetry, TelemetrySink};
pub use tracker::{
    Applied, EpisodeTracker, Next, OpenOutcome, Step, TrackerSnapshot, SNAPSHOT_SCHEMA_VERSION,
};
pub use transcripts::{InMemoryTranscripts, TranscriptSource};
pub use types::{EpisodeStatus, JobEnvelope, JobPayload, Outcome, Stage, StageCursor};
pub use worker::{process, WorkerPool};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
