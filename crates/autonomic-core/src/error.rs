//! Error types for the control loop
//!
//! Taxonomy:
//! - Transient capability-provider failures (retried by redelivery)
//! - Stale episodes (lost optimistic-concurrency race, dropped silently)
//! - Structural validation failures of refined candidates
//! - Exhausted retry budgets (the only class that needs a human)
//! - Version-store commit conflicts

use crate::types::{EpisodeStatus, Stage, StageCursor};
use autonomic_model::{AgentId, EpisodeId, TranscriptRef, ValidationError};

/// Main control-loop error type
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Capability provider timed out or answered garbage
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Episode tracker rejected a mutation
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Version store failure, including commit conflicts
    #[error("version store error: {0}")]
    Store(#[from] StoreError),

    /// Channel publish / ack failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Transcript could not be loaded
    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    /// Refined candidate is not well-formed
    #[error("structural validation failed: {0}")]
    StructuralValidation(#[from] ValidationError),

    /// Retry budget used up; episode escalated
    #[error("retry budget exhausted for agent {agent_id} (episode {episode_id}, {attempts_used} attempts): {reason}")]
    BudgetExhausted {
        episode_id: EpisodeId,
        agent_id: AgentId,
        attempts_used: u32,
        reason: String,
    },

    /// Envelope is missing data its kind requires
    #[error("malformed job: {0}")]
    MalformedJob(String),
}

impl LoopError {
    /// Check if redelivering the job may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Store(StoreError::Unavailable(_)) => true,
            Self::Transcript(TranscriptError::Unavailable(_)) => true,
            Self::Channel(ChannelError::PublishFailed(_)) => true,
            _ => false,
        }
    }

    /// Check if error is an optimistic-concurrency loss
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Tracker(TrackerError::Stale { .. }))
    }

    /// Check if error requires human intervention
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }
}

/// Capability-provider errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Client errors (4xx other than 429) are permanent; everything else is retried
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => true,
        }
    }
}

/// Episode tracker errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    #[error("episode not found: {0}")]
    NotFound(EpisodeId),

    /// The episode is not where the caller expected it
    #[error("stale episode {episode_id}: expected {expected}, found {found:?} ({status})")]
    Stale {
        episode_id: EpisodeId,
        expected: StageCursor,
        found: Option<StageCursor>,
        status: EpisodeStatus,
    },

    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    /// Advancing would start an attempt beyond the budget
    #[error("episode {episode_id} has used {attempts_used} of {max_attempts} attempts")]
    BudgetExceeded {
        episode_id: EpisodeId,
        attempts_used: u32,
        max_attempts: u32,
    },

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Version store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("no configuration for agent {0}")]
    NotFound(AgentId),

    #[error("agent {agent_id} has no version {version}")]
    VersionNotFound { agent_id: AgentId, version: u64 },

    /// A concurrent append won the race
    #[error("version conflict for agent {agent_id}: expected previous version {expected}, latest is {actual}")]
    Conflict {
        agent_id: AgentId,
        expected: u64,
        actual: u64,
    },

    #[error("configuration belongs to agent {actual}, not {expected}")]
    AgentMismatch { expected: AgentId, actual: AgentId },

    #[error("version store unavailable: {0}")]
    Unavailable(String),
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("unknown delivery {0}")]
    UnknownDelivery(u64),

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Transcript source errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript not found: {0}")]
    NotFound(TranscriptRef),

    #[error("transcript source unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_error_display() {
        let err = LoopError::from(ProviderError::Timeout { timeout_ms: 30_000 });
        assert!(err.to_string().contains("timed out after 30000ms"));
    }

    #[test]
    fn provider_failures_are_retryable() {
        assert!(LoopError::from(ProviderError::Malformed("not json".into())).is_retryable());
        assert!(LoopError::from(ProviderError::Status { status: 503, body: String::new() }).is_retryable());
        assert!(!LoopError::from(ProviderError::Status { status: 400, body: String::new() }).is_retryable());
        assert!(!LoopError::MalformedJob("x".into()).is_retryable());
    }

    #[test]
    fn only_budget_exhaustion_requires_human() {
        let exhausted = LoopError::BudgetExhausted {
            episode_id: EpisodeId::new(),
            agent_id: AgentId::from("x"),
            attempts_used: 2,
            reason: "judge rejected fix".into(),
        };
        assert!(exhausted.requires_human());
        assert!(!LoopError::from(StoreError::Conflict {
            agent_id: AgentId::from("x"),
            expected: 1,
            actual: 2,
        })
        .requires_human());
    }

    #[test]
    fn stale_is_detected() {
        let stale = LoopError::from(TrackerError::Stale {
            episode_id: EpisodeId::new(),
            expected: StageCursor::new(Stage::Refine, 1),
            found: None,
            status: EpisodeStatus::Succeeded,
        });
        assert!(stale.is_stale());
        assert!(!stale.is_retryable());
    }
}
