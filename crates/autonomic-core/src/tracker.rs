//! Episode tracker
//!
//! Single writer of episode records and the authority for "is this agent
//! currently being remediated". Every mutation is a compare-and-set against
//! the episode's current state; a caller that lost a race gets
//! [`TrackerError::Stale`] and drops its job.
//!
//! Two maps are involved: `open_by_agent` (the per-agent index) and
//! `episodes`. Any path that touches both locks the index first.

use crate::episode::{Episode, OpenRequest};
use crate::error::TrackerError;
use crate::types::{EpisodeStatus, JobEnvelope, Outcome, Stage, StageCursor};
use autonomic_model::{AgentId, EpisodeId, JobId, Verdict};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Schema version of persisted tracker snapshots
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Result of [`EpisodeTracker::try_open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new episode was created
    Opened(EpisodeId),
    /// The agent already had an open episode
    AlreadyOpen(EpisodeId),
}

impl OpenOutcome {
    /// The episode opened or found
    #[inline]
    #[must_use]
    pub fn episode_id(&self) -> EpisodeId {
        match self {
            Self::Opened(id) | Self::AlreadyOpen(id) => *id,
        }
    }
}

/// Where a transition leaves the episode
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// Stay open at the given stage
    Advance(Stage),
    /// Finish with a terminal outcome and release the agent
    Close(Outcome),
}

/// Composite mutation applied by [`EpisodeTracker::transition`]
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Verdict recorded against the expected stage
    pub verdict: Option<Verdict>,
    /// Stage move or close
    pub next: Next,
    /// Downstream job, replaced on every applied transition
    pub outbox: Option<JobEnvelope>,
}

impl Step {
    /// Move to `stage`, nothing else
    #[inline]
    #[must_use]
    pub fn advance(stage: Stage) -> Self {
        Self {
            verdict: None,
            next: Next::Advance(stage),
            outbox: None,
        }
    }

    /// Close with `outcome`
    #[inline]
    #[must_use]
    pub fn close(outcome: Outcome) -> Self {
        Self {
            verdict: None,
            next: Next::Close(outcome),
            outbox: None,
        }
    }

    /// Record `verdict` against the expected stage
    #[inline]
    #[must_use]
    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    /// Emit `job` once the step is applied
    #[inline]
    #[must_use]
    pub fn with_outbox(mut self, job: JobEnvelope) -> Self {
        self.outbox = Some(job);
        self
    }
}

/// What [`EpisodeTracker::transition`] did
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The transition had already been applied for this cause
    pub replayed: bool,
    /// Status after the transition
    pub status: EpisodeStatus,
    /// Attempts consumed after the transition
    pub attempts_used: u32,
    /// Job to publish
    pub outbox: Option<JobEnvelope>,
}

impl Applied {
    /// The already-applied transition recorded on `episode`
    pub(crate) fn from_episode(episode: &Episode) -> Self {
        Self {
            replayed: true,
            status: episode.status,
            attempts_used: episode.attempts_used,
            outbox: episode.outbox.clone(),
        }
    }
}

/// Persisted form of the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    /// Must equal [`SNAPSHOT_SCHEMA_VERSION`] to be restored
    pub schema_version: u32,
    /// Every episode, open and closed, ordered by id
    pub episodes: Vec<Episode>,
}

/// Episode tracker
#[derive(Debug, Default)]
pub struct EpisodeTracker {
    episodes: DashMap<EpisodeId, Episode>,
    open_by_agent: DashMap<AgentId, EpisodeId>,
    by_origin: DashMap<JobId, EpisodeId>,
}

impl EpisodeTracker {
    /// Create new empty tracker
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an episode unless the agent already has one open
    ///
    /// Idempotent per agent: concurrent callers for the same agent all get
    /// the same episode id, exactly one of them as `Opened`.
    pub fn try_open(&self, request: OpenRequest) -> OpenOutcome {
        match self.open_by_agent.entry(request.agent_id.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = *slot.get();
                let still_open = self
                    .episodes
                    .get(&existing)
                    .is_some_and(|e| e.is_open());
                if still_open {
                    return OpenOutcome::AlreadyOpen(existing);
                }
                // index entry left behind by a close that has not cleaned up yet
                let id = self.insert_episode(request);
                slot.insert(id);
                OpenOutcome::Opened(id)
            }
            Entry::Vacant(slot) => {
                let id = self.insert_episode(request);
                slot.insert(id);
                OpenOutcome::Opened(id)
            }
        }
    }

    fn insert_episode(&self, request: OpenRequest) -> EpisodeId {
        let episode = Episode::open(request);
        let id = episode.episode_id;
        info!(episode_id = %id, agent_id = %episode.agent_id, "episode opened");
        self.by_origin.insert(episode.origin_job, id);
        self.episodes.insert(id, episode);
        id
    }

    /// Append a verdict for the episode's current stage
    ///
    /// A failing verdict on Refine or Evaluate consumes an attempt.
    ///
    /// # Errors
    /// - `TrackerError::NotFound` for an unknown episode
    /// - `TrackerError::Stale` if the episode is closed or at another stage
    pub fn record_verdict(
        &self,
        id: EpisodeId,
        stage: Stage,
        verdict: Verdict,
    ) -> Result<(), TrackerError> {
        let mut episode = self.episodes.get_mut(&id).ok_or(TrackerError::NotFound(id))?;
        if !episode.is_open() || episode.stage != stage {
            let expected = StageCursor::new(stage, episode.attempts_used + 1);
            return Err(episode.stale(expected));
        }
        episode.push_verdict(stage, verdict);
        Ok(())
    }

    /// Move an open episode to `next`
    ///
    /// # Errors
    /// - `TrackerError::Stale` if the episode is not open
    /// - `TrackerError::IllegalTransition` for an edge outside the state machine
    /// - `TrackerError::BudgetExceeded` for a retry with no attempts left
    pub fn advance_stage(&self, id: EpisodeId, next: Stage) -> Result<(), TrackerError> {
        let mut episode = self.episodes.get_mut(&id).ok_or(TrackerError::NotFound(id))?;
        if !episode.is_open() {
            let expected = StageCursor::new(episode.stage, episode.attempts_used + 1);
            return Err(episode.stale(expected));
        }
        episode.check_advance(next, episode.attempts_used)?;
        episode.stage = next;
        episode.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Set a terminal status
    ///
    /// Closing an already-closed episode is a no-op and returns `Ok(false)`.
    ///
    /// # Errors
    /// Returns `TrackerError::NotFound` for an unknown episode
    pub fn close(&self, id: EpisodeId, outcome: Outcome) -> Result<bool, TrackerError> {
        let agent_id = {
            let mut episode = self.episodes.get_mut(&id).ok_or(TrackerError::NotFound(id))?;
            if !episode.is_open() {
                debug!(episode_id = %id, status = %episode.status, "close ignored, already closed");
                return Ok(false);
            }
            episode.finish(outcome);
            episode.outbox = None;
            episode.agent_id.clone()
        };
        self.release(&agent_id, id);
        Ok(true)
    }

    /// Apply verdict, stage move or close, and outbox as one step
    ///
    /// `expected` is the cursor the caller observed; `cause` identifies the
    /// job applying the step. If `cause` already applied the last transition
    /// the stored outbox is returned with `replayed` set and nothing changes.
    ///
    /// # Errors
    /// - `TrackerError::Stale` if the episode moved past `expected`
    /// - `TrackerError::IllegalTransition` / `TrackerError::BudgetExceeded`
    ///   if the step breaks the state machine
    pub fn transition(
        &self,
        id: EpisodeId,
        expected: StageCursor,
        cause: JobId,
        step: Step,
    ) -> Result<Applied, TrackerError> {
        let (applied, release) = {
            let mut episode = self.episodes.get_mut(&id).ok_or(TrackerError::NotFound(id))?;

            if episode.last_cause == Some(cause) {
                return Ok(Applied::from_episode(&episode));
            }
            if episode.cursor() != Some(expected) {
                return Err(episode.stale(expected));
            }

            let consumes = step
                .verdict
                .as_ref()
                .is_some_and(|v| Episode::consumes_attempt(expected.stage, v));
            let attempts_after = episode.attempts_used + u32::from(consumes);
            if let Next::Advance(stage) = &step.next {
                episode.check_advance(*stage, attempts_after)?;
            }

            if let Some(verdict) = step.verdict {
                episode.push_verdict(expected.stage, verdict);
            }
            match step.next {
                Next::Advance(stage) => {
                    episode.stage = stage;
                    episode.updated_at = chrono::Utc::now();
                }
                Next::Close(outcome) => episode.finish(outcome),
            }
            episode.last_cause = Some(cause);
            episode.outbox = step.outbox;

            debug!(
                episode_id = %id,
                from = %expected,
                to = ?episode.cursor(),
                status = %episode.status,
                "episode transition"
            );
            let applied = Applied {
                replayed: false,
                status: episode.status,
                attempts_used: episode.attempts_used,
                outbox: episode.outbox.clone(),
            };
            let release = (!episode.is_open()).then(|| episode.agent_id.clone());
            (applied, release)
        };

        if let Some(agent_id) = release {
            self.release(&agent_id, id);
        }
        Ok(applied)
    }

    fn release(&self, agent_id: &AgentId, id: EpisodeId) {
        self.open_by_agent.remove_if(agent_id, |_, open| *open == id);
    }

    /// Whether the agent has an open episode
    #[must_use]
    pub fn is_open(&self, agent_id: &AgentId) -> bool {
        self.open_episode_for(agent_id).is_some()
    }

    /// Copy of an episode record
    #[must_use]
    pub fn get(&self, id: EpisodeId) -> Option<Episode> {
        self.episodes.get(&id).map(|e| e.clone())
    }

    /// The agent's open episode, if any
    #[must_use]
    pub fn open_episode_for(&self, agent_id: &AgentId) -> Option<Episode> {
        let id = *self.open_by_agent.get(agent_id)?;
        self.get(id).filter(Episode::is_open)
    }

    /// Episode opened by the given Audit job
    #[must_use]
    pub fn episode_for_origin(&self, job_id: JobId) -> Option<Episode> {
        let id = *self.by_origin.get(&job_id)?;
        self.get(id)
    }

    /// Every episode of an agent, oldest first
    #[must_use]
    pub fn episodes_for(&self, agent_id: &AgentId) -> Vec<Episode> {
        let mut episodes: Vec<Episode> = self
            .episodes
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .map(|e| e.clone())
            .collect();
        episodes.sort_by_key(|e| e.episode_id);
        episodes
    }

    /// Number of episodes, open and closed
    #[must_use]
    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    /// Whether no episode was ever opened
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Number of open episodes
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.episodes.iter().filter(|e| e.is_open()).count()
    }

    /// Every open episode, oldest first
    #[must_use]
    pub fn open_episodes(&self) -> Vec<Episode> {
        let mut episodes: Vec<Episode> = self
            .episodes
            .iter()
            .filter(|e| e.is_open())
            .map(|e| e.clone())
            .collect();
        episodes.sort_by_key(|e| e.episode_id);
        episodes
    }

    /// Copy of every episode record
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        let mut episodes: Vec<Episode> = self.episodes.iter().map(|e| e.clone()).collect();
        episodes.sort_by_key(|e| e.episode_id);
        TrackerSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            episodes,
        }
    }

    /// Rebuild a tracker and its indexes from a snapshot
    ///
    /// # Errors
    /// Returns `TrackerError::Persistence` for an unknown schema version or a
    /// snapshot with two open episodes for one agent
    pub fn restore(snapshot: TrackerSnapshot) -> Result<Self, TrackerError> {
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(TrackerError::Persistence(format!(
                "unsupported schema version {} (expected {SNAPSHOT_SCHEMA_VERSION})",
                snapshot.schema_version
            )));
        }
        let tracker = Self::new();
        for episode in snapshot.episodes {
            let id = episode.episode_id;
            if episode.is_open() {
                if let Some(other) = tracker.open_by_agent.insert(episode.agent_id.clone(), id) {
                    return Err(TrackerError::Persistence(format!(
                        "agent {} has two open episodes ({other}, {id})",
                        episode.agent_id
                    )));
                }
            }
            tracker.by_origin.insert(episode.origin_job, id);
            tracker.episodes.insert(id, episode);
        }
        Ok(tracker)
    }

    /// Write a JSON snapshot, replacing `path` atomically
    ///
    /// # Errors
    /// Returns `TrackerError::Persistence` on serialization or I/O failure
    pub fn save_to(&self, path: &Path) -> Result<(), TrackerError> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| TrackerError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| TrackerError::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| TrackerError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Load a tracker written by [`EpisodeTracker::save_to`]
    ///
    /// # Errors
    /// Returns `TrackerError::Persistence` on I/O, parse or schema failure
    pub fn load_from(path: &Path) -> Result<Self, TrackerError> {
        let bytes = std::fs::read(path).map_err(|e| TrackerError::Persistence(e.to_string()))?;
        let snapshot: TrackerSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| TrackerError::Persistence(e.to_string()))?;
        Self::restore(snapshot)
    }
}
