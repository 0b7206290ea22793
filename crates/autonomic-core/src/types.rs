//! Core types for the control loop
//!
//! Defines:
//! - Stages and episode statuses
//! - Terminal outcomes
//! - The job envelope carried on the channel and its stage cursor

use autonomic_model::{AgentConfig, AgentId, EpisodeId, JobId, TranscriptRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Score a live transcript against the rulebook
    Audit,
    /// Synthesize a candidate configuration
    Refine,
    /// Judge the candidate in a sandbox replay
    Evaluate,
}

impl Stage {
    /// All stages, pipeline order
    pub const ALL: [Stage; 3] = [Stage::Audit, Stage::Refine, Stage::Evaluate];

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Audit => "audit",
            Stage::Refine => "refine",
            Stage::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Open,
    /// A corrected configuration was committed
    Succeeded,
    /// Unrecoverable capability-provider error
    Failed,
    /// Retry budget exhausted; needs a human
    Escalated,
}

impl EpisodeStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EpisodeStatus::Open)
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EpisodeStatus::Open => "open",
            EpisodeStatus::Succeeded => "succeeded",
            EpisodeStatus::Failed => "failed",
            EpisodeStatus::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// How an episode ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { version: u64 },
    Failed { reason: String },
    Escalated { reason: String },
}

impl Outcome {
    #[inline]
    #[must_use]
    pub fn status(&self) -> EpisodeStatus {
        match self {
            Outcome::Succeeded { .. } => EpisodeStatus::Succeeded,
            Outcome::Failed { .. } => EpisodeStatus::Failed,
            Outcome::Escalated { .. } => EpisodeStatus::Escalated,
        }
    }
}

/// Position of an open episode: which stage, which attempt
///
/// `attempt` is always `attempts_used + 1` for the episode, so a failed
/// Refine or Evaluate moves the cursor even when the stage repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageCursor {
    pub stage: Stage,
    pub attempt: u32,
}

impl StageCursor {
    #[inline]
    #[must_use]
    pub const fn new(stage: Stage, attempt: u32) -> Self {
        Self { stage, attempt }
    }
}

impl fmt::Display for StageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stage, self.attempt)
    }
}

/// Stage-specific job content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Audit,
    Refine,
    Evaluate { candidate: Box<AgentConfig> },
}

/// Unit of work carried on the channel
///
/// Redeliveries carry the same `job_id`; children reference their parent
/// through `parent_job_id` so a chain can be traced end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub agent_id: AgentId,
    /// Absent on Audit jobs, which run before an episode exists
    pub episode_id: Option<EpisodeId>,
    pub transcript_ref: TranscriptRef,
    /// Config version the job was issued against
    pub config_version: u64,
    /// Non-decreasing along one episode's chain
    pub attempt: u32,
    pub parent_job_id: Option<JobId>,
    pub issued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl JobEnvelope {
    /// Audit request published by the front door
    #[must_use]
    pub fn audit(agent_id: AgentId, transcript_ref: TranscriptRef, config_version: u64) -> Self {
        Self {
            job_id: JobId::new(),
            agent_id,
            episode_id: None,
            transcript_ref,
            config_version,
            attempt: 1,
            parent_job_id: None,
            issued_at: Utc::now(),
            payload: JobPayload::Audit,
        }
    }

    /// Refine job caused by this job
    #[must_use]
    pub fn refine_child(&self, episode_id: EpisodeId, attempt: u32, config_version: u64) -> Self {
        self.child(episode_id, attempt, config_version, JobPayload::Refine)
    }

    /// Evaluate job carrying `candidate`, caused by this job
    #[must_use]
    pub fn evaluate_child(
        &self,
        episode_id: EpisodeId,
        candidate: AgentConfig,
        config_version: u64,
    ) -> Self {
        self.child(
            episode_id,
            self.attempt,
            config_version,
            JobPayload::Evaluate {
                candidate: Box::new(candidate),
            },
        )
    }

    fn child(
        &self,
        episode_id: EpisodeId,
        attempt: u32,
        config_version: u64,
        payload: JobPayload,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            agent_id: self.agent_id.clone(),
            episode_id: Some(episode_id),
            transcript_ref: self.transcript_ref.clone(),
            config_version,
            attempt: attempt.max(self.attempt),
            parent_job_id: Some(self.job_id),
            issued_at: Utc::now(),
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> Stage {
        match self.payload {
            JobPayload::Audit => Stage::Audit,
            JobPayload::Refine => Stage::Refine,
            JobPayload::Evaluate { .. } => Stage::Evaluate,
        }
    }

    /// Episode position this job expects to find
    #[inline]
    #[must_use]
    pub fn cursor(&self) -> StageCursor {
        StageCursor::new(self.kind(), self.attempt)
    }

    #[inline]
    #[must_use]
    pub fn candidate(&self) -> Option<&AgentConfig> {
        match &self.payload {
            JobPayload::Evaluate { candidate } => Some(candidate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_link_to_parent_and_keep_attempt_monotonic() {
        let audit = JobEnvelope::audit(AgentId::from("x"), TranscriptRef::from("chat-1"), 1);
        let episode = EpisodeId::new();

        let refine = audit.refine_child(episode, 1, 1);
        assert_eq!(refine.parent_job_id, Some(audit.job_id));
        assert_eq!(refine.cursor(), StageCursor::new(Stage::Refine, 1));

        let retry = refine.refine_child(episode, 2, 1);
        assert_eq!(retry.attempt, 2);

        // never goes backwards even if asked to
        let odd = retry.refine_child(episode, 1, 1);
        assert_eq!(odd.attempt, 2);
    }

    #[test]
    fn envelope_wire_format_is_tagged_by_kind() {
        let audit = JobEnvelope::audit(AgentId::from("x"), TranscriptRef::from("chat-1"), 3);
        let json = serde_json::to_value(&audit).unwrap();
        assert_eq!(json["kind"], "audit");
        assert_eq!(json["agent_id"], "x");
        let back: JobEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, audit);
    }

    #[test]
    fn outcome_maps_to_status() {
        assert_eq!(Outcome::Succeeded { version: 2 }.status(), EpisodeStatus::Succeeded);
        assert!(EpisodeStatus::Escalated.is_terminal());
        assert!(!EpisodeStatus::Open.is_terminal());
    }
}
