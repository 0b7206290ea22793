//! Testing utilities for the autonomic workspace
//!
//! Shared fixtures, scripted capability providers and a fully wired
//! in-process loop.

#![allow(missing_docs)]

mod fixtures;
mod scripted;
mod world;

pub use fixtures::{
    clean_transcript, flagged_transcript, sample_config, CLEAN_REPLY, FLAGGED_REPLY,
    FORBIDDEN_PHRASE,
};
pub use scripted::{JudgeScript, RefineScript, ScriptedProvider};
pub use world::World;
