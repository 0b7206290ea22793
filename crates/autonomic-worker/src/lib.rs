//! Autonomic Worker
//!
//! Process-level wiring for the control loop: logging setup, the scenario
//! simulator and the local run mode behind the `autonomic` binary.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod logging;
pub mod runner;
pub mod simulator;

pub use logging::LogFormat;
pub use runner::{run, AuditRequest, RunOptions, RunSummary};
pub use simulator::{run_simulator, ScenarioResult, SimulatorConfig, SimulatorReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
