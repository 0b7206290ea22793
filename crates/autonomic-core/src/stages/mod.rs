//! Stage handlers
//!
//! Pure functions of their inputs: each calls one capability provider under
//! a timeout and returns the result. They never touch the tracker, the
//! version store or the channel; the coordinator applies their results.

pub mod audit;
pub mod evaluate;
pub mod refine;

pub use refine::RefineOutcome;
