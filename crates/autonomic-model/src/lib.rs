//! Autonomic Model
//!
//! The immutable values that flow through the autonomic control loop.
//!
//! # Core Concepts
//!
//! - [`AgentConfig`]: Versioned snapshot of a deployed conversational agent
//! - [`Transcript`]: Ordered turns of one captured conversation
//! - [`Verdict`]: Outcome of scoring or evaluating against a rulebook / rubric
//! - [`ContentHash`]: Blake3 fingerprint used to compare configurations
//! - [`StructuralValidator`]: Local well-formedness checks for refined candidates
//!
//! # Example
//!
//! ```rust,ignore
//! use autonomic_model::{AgentConfig, StructuralValidator};
//!
//! let current = store.get_latest(&agent_id).await?;
//! let candidate = refiner.refine(&transcript, &verdict, &current).await?.value;
//!
//! StructuralValidator::new().validate(&current, &candidate)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod agent;
mod hash;
mod ids;
mod transcript;
mod validation;
mod verdict;

pub use agent::{
    AgentConfig, ModelParameters, Persona, PromptStructure, Provenance, Rubric, Rule, Rulebook,
    DEFAULT_AUDIT_RULE,
};
pub use hash::{ContentHash, HashError};
pub use ids::{AgentId, EpisodeId, JobId, RuleId, TranscriptRef};
pub use transcript::{Role, Transcript, Turn};
pub use validation::{StructuralValidator, ValidationError};
pub use verdict::{Priority, ProviderMetrics, Verdict};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
