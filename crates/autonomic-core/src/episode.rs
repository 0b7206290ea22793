//! Remediation episodes and their stage state machine

use crate::error::TrackerError;
use crate::types::{EpisodeStatus, JobEnvelope, Outcome, Stage, StageCursor};
use autonomic_model::{AgentId, EpisodeId, JobId, TranscriptRef, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stages an open episode may move to from `from`
#[must_use]
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::{Audit, Evaluate, Refine};
    match from {
        Audit => vec![Refine],
        // Refine -> Refine is the retry after a structurally invalid candidate
        Refine => vec![Evaluate, Refine],
        Evaluate => vec![Refine],
    }
}

/// Validate a stage transition
///
/// # Errors
/// Returns `TrackerError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), TrackerError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TrackerError::IllegalTransition { from, to })
    }
}

/// A verdict as recorded in an episode's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// Stage that produced the verdict
    pub stage: Stage,
    /// Attempt the verdict was recorded under, starting at 1
    pub attempt: u32,
    /// The verdict as returned by the stage
    pub verdict: Verdict,
    /// When the tracker recorded it
    pub recorded_at: DateTime<Utc>,
}

/// Parameters for opening an episode
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Agent that failed the audit
    pub agent_id: AgentId,
    /// Conversation that failed the audit
    pub transcript_ref: TranscriptRef,
    /// Audit job whose failing verdict opens the episode
    pub origin_job: JobId,
    /// Config version the audit ran against
    pub base_version: u64,
    /// Refine/evaluate attempts before escalation
    pub max_attempts: u32,
}

/// One remediation attempt chain for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Unique, time-ordered id
    pub episode_id: EpisodeId,
    /// Agent under remediation
    pub agent_id: AgentId,
    /// Conversation whose audit failed
    pub transcript_ref: TranscriptRef,
    /// Audit job that opened the episode
    pub origin_job: JobId,
    /// Config version the failing audit ran against
    pub base_version: u64,
    /// Stage currently expected to run
    pub stage: Stage,
    /// Rejected refine or evaluate attempts so far
    pub attempts_used: u32,
    /// Refine/evaluate attempts before escalation
    pub max_attempts: u32,
    /// `Open` until a terminal outcome is set
    pub status: EpisodeStatus,
    /// Set once the episode is closed
    pub outcome: Option<Outcome>,
    /// When the episode was opened
    pub created_at: DateTime<Utc>,
    /// Last stage move or close
    pub updated_at: DateTime<Utc>,
    /// Every verdict in the order it was recorded
    pub verdicts: Vec<VerdictRecord>,
    /// Job whose transition was applied last
    pub last_cause: Option<JobId>,
    /// Downstream job emitted by that transition
    pub outbox: Option<JobEnvelope>,
}

impl Episode {
    /// Create new open episode at the Audit stage
    #[must_use]
    pub fn open(request: OpenRequest) -> Self {
        let now = Utc::now();
        Self {
            episode_id: EpisodeId::new(),
            agent_id: request.agent_id,
            transcript_ref: request.transcript_ref,
            origin_job: request.origin_job,
            base_version: request.base_version,
            stage: Stage::Audit,
            attempts_used: 0,
            max_attempts: request.max_attempts,
            status: EpisodeStatus::Open,
            outcome: None,
            created_at: now,
            updated_at: now,
            verdicts: Vec::new(),
            last_cause: None,
            outbox: None,
        }
    }

    /// Whether the episode is still `Open`
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == EpisodeStatus::Open
    }

    /// Current position; `None` once the episode is closed
    #[inline]
    #[must_use]
    pub fn cursor(&self) -> Option<StageCursor> {
        self.is_open()
            .then(|| StageCursor::new(self.stage, self.attempts_used + 1))
    }

    /// Whether another refine attempt may start
    #[inline]
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.attempts_used < self.max_attempts
    }

    /// Most recent failing verdict, the input to the next refinement
    #[must_use]
    pub fn last_failure(&self) -> Option<&Verdict> {
        self.verdicts
            .iter()
            .rev()
            .map(|r| &r.verdict)
            .find(|v| !v.passed)
    }

    /// Whether a failing verdict at `stage` consumes an attempt
    #[inline]
    #[must_use]
    pub fn consumes_attempt(stage: Stage, verdict: &Verdict) -> bool {
        !verdict.passed && matches!(stage, Stage::Refine | Stage::Evaluate)
    }

    pub(crate) fn stale(&self, expected: StageCursor) -> TrackerError {
        TrackerError::Stale {
            episode_id: self.episode_id,
            expected,
            found: self.cursor(),
            status: self.status,
        }
    }

    pub(crate) fn push_verdict(&mut self, stage: Stage, verdict: Verdict) {
        let attempt = self.attempts_used + 1;
        if Self::consumes_attempt(stage, &verdict) {
            self.attempts_used += 1;
        }
        self.verdicts.push(VerdictRecord {
            stage,
            attempt,
            verdict,
            recorded_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Check that moving to `next` is legal with `attempts_used` attempts spent
    pub(crate) fn check_advance(&self, next: Stage, attempts_used: u32) -> Result<(), TrackerError> {
        validate_transition(self.stage, next)?;
        if next == Stage::Refine && attempts_used >= self.max_attempts {
            return Err(TrackerError::BudgetExceeded {
                episode_id: self.episode_id,
                attempts_used,
                max_attempts: self.max_attempts,
            });
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self, outcome: Outcome) {
        self.status = outcome.status();
        self.outcome = Some(outcome);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode() -> Episode {
        Episode::open(OpenRequest {
            agent_id: AgentId::from("x"),
            transcript_ref: TranscriptRef::from("chat-1"),
            origin_job: JobId::new(),
            base_version: 1,
            max_attempts: 2,
        })
    }

    #[test]
    fn transition_table() {
        assert!(validate_transition(Stage::Audit, Stage::Refine).is_ok());
        assert!(validate_transition(Stage::Refine, Stage::Evaluate).is_ok());
        assert!(validate_transition(Stage::Evaluate, Stage::Refine).is_ok());
        assert!(validate_transition(Stage::Refine, Stage::Refine).is_ok());
        assert_eq!(
            validate_transition(Stage::Audit, Stage::Evaluate),
            Err(TrackerError::IllegalTransition {
                from: Stage::Audit,
                to: Stage::Evaluate
            })
        );
        assert!(validate_transition(Stage::Evaluate, Stage::Audit).is_err());
    }

    #[test]
    fn new_episode_starts_at_audit_attempt_one() {
        let ep = episode();
        assert_eq!(ep.cursor(), Some(StageCursor::new(Stage::Audit, 1)));
        assert!(ep.has_budget());
    }

    #[test]
    fn only_refine_and_evaluate_failures_consume_attempts() {
        let mut ep = episode();
        ep.push_verdict(Stage::Audit, Verdict::fail("discount offered", vec![]));
        assert_eq!(ep.attempts_used, 0);
        ep.stage = Stage::Evaluate;
        ep.push_verdict(Stage::Evaluate, Verdict::pass("fixed"));
        assert_eq!(ep.attempts_used, 0);
        ep.push_verdict(Stage::Evaluate, Verdict::fail("still offers discount", vec![]));
        assert_eq!(ep.attempts_used, 1);
        assert_eq!(ep.verdicts[2].attempt, 1);
        assert_eq!(ep.last_failure().map(|v| v.rationale.as_str()), Some("still offers discount"));
    }

    #[test]
    fn retry_refused_when_budget_spent() {
        let mut ep = episode();
        ep.stage = Stage::Evaluate;
        assert!(ep.check_advance(Stage::Refine, 1).is_ok());
        assert!(matches!(
            ep.check_advance(Stage::Refine, 2),
            Err(TrackerError::BudgetExceeded { attempts_used: 2, .. })
        ));
    }

    #[test]
    fn closed_episode_has_no_cursor() {
        let mut ep = episode();
        ep.finish(Outcome::Escalated {
            reason: "judge rejected fix".into(),
        });
        assert_eq!(ep.status, EpisodeStatus::Escalated);
        assert_eq!(ep.cursor(), None);
    }
}
