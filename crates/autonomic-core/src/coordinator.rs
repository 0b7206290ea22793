//! Loop coordinator
//!
//! Wraps every stage handler in the same sequence:
//!
//! 1. Fetch the episode and check the job still matches its cursor
//! 2. Run the stage handler (no locks held)
//! 3. Apply the result to the tracker as one compare-and-set transition
//! 4. Publish the downstream job stored in the transition's outbox
//!
//! A redelivered job whose transition was already applied republishes the
//! outbox instead of running again; a job whose episode has moved on is
//! dropped as stale.

use crate::channel::Channel;
use crate::config::LoopConfig;
use crate::episode::{Episode, OpenRequest};
use crate::error::{LoopError, StoreError, TrackerError};
use crate::provider::Providers;
use crate::stages::{self, RefineOutcome};
use crate::store::VersionStore;
use crate::telemetry::{LoopEvent, TelemetrySink};
use crate::tracker::{Applied, EpisodeTracker, OpenOutcome, Step};
use crate::transcripts::TranscriptSource;
use crate::types::{JobEnvelope, Outcome, Stage, StageCursor};
use autonomic_model::{
    AgentConfig, AgentId, EpisodeId, ProviderMetrics, StructuralValidator, TranscriptRef, Verdict,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a job was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    /// Audit passed; nothing to remediate
    AuditPassed,
    /// Audit failed but the agent is already being remediated
    Suppressed,
    /// Episode moved to the next stage
    Advanced,
    /// Attempt rejected; a new refine job was issued
    Retrying,
    /// Candidate committed, episode closed
    Succeeded,
    /// Budget exhausted, episode closed for human review
    Escalated,
    /// Transition was already applied; outbox republished
    Replayed,
    /// Episode moved past this job
    Stale,
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuditPassed => "audit_passed",
            Self::Suppressed => "suppressed",
            Self::Advanced => "advanced",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Escalated => "escalated",
            Self::Replayed => "replayed",
            Self::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// What the worker should do with a delivery
#[derive(Debug)]
pub enum Disposition {
    /// Done with the job
    Ack(AckReason),
    /// Transient failure; redeliver
    Retry(LoopError),
}

/// External collaborators of the coordinator
#[derive(Clone)]
pub struct LoopPorts {
    pub store: Arc<dyn VersionStore>,
    pub transcripts: Arc<dyn TranscriptSource>,
    pub providers: Providers,
    pub channel: Arc<dyn Channel>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Episode precondition check result
enum Guard {
    Run(Episode),
    Replay(Applied),
}

/// Result of committing a judged candidate
enum Commit {
    Committed(u64),
    Conflict,
}

/// Drives jobs through the stage handlers
pub struct LoopCoordinator {
    config: LoopConfig,
    tracker: Arc<EpisodeTracker>,
    ports: LoopPorts,
    validator: StructuralValidator,
}

impl fmt::Debug for LoopCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopCoordinator")
            .field("config", &self.config)
            .field("episodes", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl LoopCoordinator {
    /// Create new coordinator
    #[must_use]
    pub fn new(config: LoopConfig, tracker: Arc<EpisodeTracker>, ports: LoopPorts) -> Self {
        Self {
            config,
            tracker,
            ports,
            validator: StructuralValidator::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &Arc<EpisodeTracker> {
        &self.tracker
    }

    #[inline]
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.ports.channel
    }

    /// Publish an Audit job for a captured conversation
    ///
    /// # Errors
    /// Returns an error if the agent is unknown or the publish fails
    pub async fn submit_audit(
        &self,
        agent_id: AgentId,
        transcript_ref: TranscriptRef,
    ) -> Result<JobEnvelope, LoopError> {
        let current = self.ports.store.get_latest(&agent_id).await?;
        let job = JobEnvelope::audit(agent_id, transcript_ref, current.version);
        self.publish(job.clone()).await?;
        Ok(job)
    }

    /// Process one job
    ///
    /// Stale jobs are acknowledged; transient failures ask for redelivery.
    ///
    /// # Errors
    /// Returns non-retryable failures; the caller should [`abandon`](Self::abandon)
    /// the job
    pub async fn handle(&self, job: &JobEnvelope) -> Result<Disposition, LoopError> {
        let result = match job.kind() {
            Stage::Audit => self.on_audit(job).await,
            Stage::Refine => self.on_refine(job).await,
            Stage::Evaluate => self.on_evaluate(job).await,
        };
        match result {
            Ok(reason) => Ok(Disposition::Ack(reason)),
            Err(err) if err.is_stale() => {
                debug!(error = %err, "dropping stale job");
                Ok(Disposition::Ack(AckReason::Stale))
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "transient failure, job will be redelivered");
                Ok(Disposition::Retry(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Give up on a job after its delivery attempts are exhausted
    ///
    /// An unscorable audit is only logged. Otherwise the job's episode is
    /// closed as `Failed` if it is still waiting on the job, or if the job's
    /// transition landed but its follow-up job was never published.
    pub fn abandon(&self, job: &JobEnvelope, err: &LoopError) {
        let episode_id = job.episode_id.or_else(|| {
            self.tracker
                .episode_for_origin(job.job_id)
                .map(|e| e.episode_id)
        });
        let Some(episode_id) = episode_id else {
            warn!(
                job_id = %job.job_id,
                agent_id = %job.agent_id,
                error = %err,
                "audit could not be scored, dropping"
            );
            return;
        };
        let step = Step::close(Outcome::Failed {
            reason: err.to_string(),
        });
        match self.tracker.transition(episode_id, job.cursor(), job.job_id, step) {
            Ok(applied) if !applied.replayed => error!(
                episode_id = %episode_id,
                agent_id = %job.agent_id,
                stage = %job.kind(),
                error = %err,
                "episode failed on unrecoverable error"
            ),
            Ok(applied) if applied.outbox.is_some() => {
                let outcome = Outcome::Failed {
                    reason: format!("follow-up job not delivered: {err}"),
                };
                match self.tracker.close(episode_id, outcome) {
                    Ok(true) => error!(
                        episode_id = %episode_id,
                        agent_id = %job.agent_id,
                        stage = %job.kind(),
                        error = %err,
                        "follow-up job could not be published, episode failed"
                    ),
                    Ok(false) => {}
                    Err(e) => debug!(episode_id = %episode_id, error = %e, "abandon ignored"),
                }
            }
            Ok(_) => warn!(
                episode_id = %episode_id,
                error = %err,
                "job abandoned after its episode closed"
            ),
            Err(e) => debug!(episode_id = %episode_id, error = %e, "abandon ignored"),
        }
    }

    /// Republish the pending job of every open episode
    ///
    /// Call once after restoring a tracker snapshot; the jobs that were in
    /// flight did not survive the restart. An open episode without a pending
    /// job cannot advance and is closed as `Failed`. Returns the number of
    /// episodes resumed.
    ///
    /// # Errors
    /// Returns the first publish failure
    pub async fn resume_open(&self) -> Result<usize, LoopError> {
        let mut resumed = 0;
        for episode in self.tracker.open_episodes() {
            let Some(job) = episode.outbox else {
                warn!(
                    episode_id = %episode.episode_id,
                    agent_id = %episode.agent_id,
                    stage = %episode.stage,
                    "open episode has no pending job, failing it"
                );
                self.tracker.close(
                    episode.episode_id,
                    Outcome::Failed {
                        reason: "no pending job after restart".into(),
                    },
                )?;
                continue;
            };
            info!(
                episode_id = %episode.episode_id,
                agent_id = %episode.agent_id,
                job_id = %job.job_id,
                stage = %job.kind(),
                "resuming episode"
            );
            self.publish(job).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn on_audit(&self, job: &JobEnvelope) -> Result<AckReason, LoopError> {
        // redelivery of an audit that already opened an episode
        if let Some(episode) = self.tracker.episode_for_origin(job.job_id) {
            if episode.last_cause == Some(job.job_id) {
                return self.replay(&Applied::from_episode(&episode)).await;
            }
            if episode.cursor() != Some(job.cursor()) {
                return Err(episode.stale(job.cursor()).into());
            }
        }

        let current = self.ports.store.get_latest(&job.agent_id).await?;
        let transcript = self.ports.transcripts.fetch(&job.transcript_ref).await?;
        let verdict = stages::audit::run(
            self.ports.providers.scorer.as_ref(),
            &transcript,
            &current,
            self.config.provider_timeout(),
        )
        .await?;
        self.emit_metrics(&job.agent_id, Stage::Audit, verdict.metrics);
        self.ports.telemetry.emit(LoopEvent::AuditVerdict {
            agent_id: job.agent_id.clone(),
            passed: verdict.passed,
            priority: verdict.priority,
        });
        if verdict.passed {
            return Ok(AckReason::AuditPassed);
        }

        let episode_id = match self.tracker.try_open(OpenRequest {
            agent_id: job.agent_id.clone(),
            transcript_ref: job.transcript_ref.clone(),
            origin_job: job.job_id,
            base_version: current.version,
            max_attempts: self.config.max_attempts,
        }) {
            OpenOutcome::Opened(id) => id,
            OpenOutcome::AlreadyOpen(id) => {
                let ours = self
                    .tracker
                    .get(id)
                    .is_some_and(|e| e.origin_job == job.job_id);
                if !ours {
                    info!(
                        agent_id = %job.agent_id,
                        episode_id = %id,
                        "agent already under remediation, audit failure suppressed"
                    );
                    return Ok(AckReason::Suppressed);
                }
                id
            }
        };

        let refine = job.refine_child(episode_id, 1, current.version);
        let applied = self.tracker.transition(
            episode_id,
            StageCursor::new(Stage::Audit, 1),
            job.job_id,
            Step::advance(Stage::Refine)
                .with_verdict(verdict)
                .with_outbox(refine),
        )?;
        info!(episode_id = %episode_id, agent_id = %job.agent_id, "audit failed, remediation started");
        self.settle(&applied, AckReason::Advanced).await
    }

    async fn on_refine(&self, job: &JobEnvelope) -> Result<AckReason, LoopError> {
        let episode = match self.guard(job)? {
            Guard::Replay(applied) => return self.replay(&applied).await,
            Guard::Run(episode) => episode,
        };
        let failing = episode
            .last_failure()
            .cloned()
            .ok_or_else(|| LoopError::MalformedJob(format!("episode {} has no failing verdict", episode.episode_id)))?;

        let current = self.ports.store.get_latest(&job.agent_id).await?;
        let transcript = self.ports.transcripts.fetch(&job.transcript_ref).await?;
        let outcome = stages::refine::run(
            self.ports.providers.refiner.as_ref(),
            &self.validator,
            &transcript,
            &failing,
            &current,
            episode.episode_id,
            self.config.provider_timeout(),
        )
        .await?;

        match outcome {
            RefineOutcome::Candidate { candidate, metrics } => {
                self.emit_metrics(&job.agent_id, Stage::Refine, metrics);
                let evaluate = job.evaluate_child(episode.episode_id, candidate, current.version);
                let applied = self.tracker.transition(
                    episode.episode_id,
                    job.cursor(),
                    job.job_id,
                    Step::advance(Stage::Evaluate).with_outbox(evaluate),
                )?;
                self.settle(&applied, AckReason::Advanced).await
            }
            RefineOutcome::Invalid { error, verdict } => {
                self.emit_metrics(&job.agent_id, Stage::Refine, verdict.metrics);
                warn!(
                    episode_id = %episode.episode_id,
                    agent_id = %job.agent_id,
                    error = %LoopError::StructuralValidation(error),
                    "refined candidate rejected, attempt consumed"
                );
                self.after_rejection(job, &episode, verdict, current.version)
                    .await
            }
        }
    }

    async fn on_evaluate(&self, job: &JobEnvelope) -> Result<AckReason, LoopError> {
        let candidate = job
            .candidate()
            .ok_or_else(|| LoopError::MalformedJob("evaluate job without candidate".into()))?;
        let episode = match self.guard(job)? {
            Guard::Replay(applied) => return self.replay(&applied).await,
            Guard::Run(episode) => episode,
        };
        let episode_id = episode.episode_id;

        let current = self.ports.store.get_latest(&job.agent_id).await?;
        if current.committed_by(episode_id) {
            // commit landed on an earlier delivery but the close did not
            return self.finish_success(job, episode_id, None, current.version);
        }

        let transcript = self.ports.transcripts.fetch(&job.transcript_ref).await?;
        let verdict = stages::evaluate::run(
            self.ports.providers.judge.as_ref(),
            candidate,
            &transcript,
            &current,
            self.config.provider_timeout(),
        )
        .await?;
        self.emit_metrics(&job.agent_id, Stage::Evaluate, verdict.metrics);

        if !verdict.passed {
            info!(episode_id = %episode_id, rationale = %verdict.rationale, "candidate rejected by judge");
            return self
                .after_rejection(job, &episode, verdict, current.version)
                .await;
        }

        match self
            .commit(&job.agent_id, episode_id, candidate, job.config_version)
            .await?
        {
            Commit::Committed(version) => {
                self.finish_success(job, episode_id, Some(verdict), version)
            }
            Commit::Conflict => {
                self.escalate(job, &episode, verdict, "version conflict".to_string())
            }
        }
    }

    /// Look up the job's episode and check it is still waiting on this job
    fn guard(&self, job: &JobEnvelope) -> Result<Guard, LoopError> {
        let episode_id = job
            .episode_id
            .ok_or_else(|| LoopError::MalformedJob(format!("{} job without episode", job.kind())))?;
        let episode = self
            .tracker
            .get(episode_id)
            .ok_or(TrackerError::NotFound(episode_id))?;
        if episode.agent_id != job.agent_id {
            return Err(LoopError::MalformedJob(format!(
                "job for agent {} references episode of agent {}",
                job.agent_id, episode.agent_id
            )));
        }
        if episode.last_cause == Some(job.job_id) {
            return Ok(Guard::Replay(Applied::from_episode(&episode)));
        }
        if episode.cursor() != Some(job.cursor()) {
            return Err(episode.stale(job.cursor()).into());
        }
        Ok(Guard::Run(episode))
    }

    /// Record a failed attempt; retry if budget remains, else escalate
    async fn after_rejection(
        &self,
        job: &JobEnvelope,
        episode: &Episode,
        verdict: Verdict,
        config_version: u64,
    ) -> Result<AckReason, LoopError> {
        let attempts_after = episode.attempts_used + 1;
        if attempts_after >= episode.max_attempts {
            let reason = verdict.rationale.clone();
            return self.escalate(job, episode, verdict, reason);
        }

        let retry = job.refine_child(episode.episode_id, attempts_after + 1, config_version);
        let applied = self.tracker.transition(
            episode.episode_id,
            job.cursor(),
            job.job_id,
            Step::advance(Stage::Refine)
                .with_verdict(verdict)
                .with_outbox(retry),
        )?;
        info!(
            episode_id = %episode.episode_id,
            attempts_used = applied.attempts_used,
            max_attempts = episode.max_attempts,
            "attempt rejected, refining again"
        );
        self.settle(&applied, AckReason::Retrying).await
    }

    fn escalate(
        &self,
        job: &JobEnvelope,
        episode: &Episode,
        verdict: Verdict,
        reason: String,
    ) -> Result<AckReason, LoopError> {
        let applied = self.tracker.transition(
            episode.episode_id,
            job.cursor(),
            job.job_id,
            Step::close(Outcome::Escalated {
                reason: reason.clone(),
            })
            .with_verdict(verdict),
        )?;
        if !applied.replayed {
            let err = LoopError::BudgetExhausted {
                episode_id: episode.episode_id,
                agent_id: job.agent_id.clone(),
                attempts_used: applied.attempts_used,
                reason: reason.clone(),
            };
            error!(
                episode_id = %episode.episode_id,
                agent_id = %job.agent_id,
                stage = %job.kind(),
                requires_human = err.requires_human(),
                error = %err,
                "episode escalated"
            );
            self.ports.telemetry.emit(LoopEvent::OptimizationFailed {
                agent_id: job.agent_id.clone(),
                episode_id: episode.episode_id,
                reason,
            });
        }
        Ok(AckReason::Escalated)
    }

    fn finish_success(
        &self,
        job: &JobEnvelope,
        episode_id: EpisodeId,
        verdict: Option<Verdict>,
        version: u64,
    ) -> Result<AckReason, LoopError> {
        let mut step = Step::close(Outcome::Succeeded { version });
        if let Some(verdict) = verdict {
            step = step.with_verdict(verdict);
        }
        let applied = self
            .tracker
            .transition(episode_id, job.cursor(), job.job_id, step)?;
        if !applied.replayed {
            info!(episode_id = %episode_id, agent_id = %job.agent_id, version, "candidate deployed");
            self.ports.telemetry.emit(LoopEvent::DeploymentSuccess {
                agent_id: job.agent_id.clone(),
                episode_id,
                version,
            });
        }
        Ok(AckReason::Succeeded)
    }

    /// Append the candidate; on conflict rebase once onto the latest version
    async fn commit(
        &self,
        agent_id: &AgentId,
        episode_id: EpisodeId,
        candidate: &AgentConfig,
        expected_prev: u64,
    ) -> Result<Commit, LoopError> {
        let store = &self.ports.store;
        match store
            .append(agent_id, candidate.rebased_on(expected_prev), expected_prev)
            .await
        {
            Ok(version) => return Ok(Commit::Committed(version)),
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(agent_id = %agent_id, expected_prev, actual, "commit conflict, refreshing");
            }
            Err(e) => return Err(e.into()),
        }

        let latest = store.get_latest(agent_id).await?;
        if latest.committed_by(episode_id) {
            return Ok(Commit::Committed(latest.version));
        }
        // the candidate was refined and judged against `base`; only rebase
        // over versions that left its content alone
        let base = store.get_by_version(agent_id, expected_prev).await?;
        match (base.fingerprint(), latest.fingerprint()) {
            (Ok(judged), Ok(current)) if judged == current => {}
            (judged, current) => {
                warn!(
                    agent_id = %agent_id,
                    base = expected_prev,
                    latest = latest.version,
                    judged = ?judged.ok().map(|h| h.to_string()),
                    current = ?current.ok().map(|h| h.to_string()),
                    "configuration changed under the candidate, not rebasing"
                );
                return Ok(Commit::Conflict);
            }
        }
        match store
            .append(agent_id, candidate.rebased_on(latest.version), latest.version)
            .await
        {
            Ok(version) => Ok(Commit::Committed(version)),
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(agent_id = %agent_id, actual, "commit conflict after rebase");
                Ok(Commit::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replay(&self, applied: &Applied) -> Result<AckReason, LoopError> {
        if let Some(job) = &applied.outbox {
            debug!(job_id = %job.job_id, "republishing outbox");
            self.publish(job.clone()).await?;
        }
        Ok(AckReason::Replayed)
    }

    async fn settle(&self, applied: &Applied, reason: AckReason) -> Result<AckReason, LoopError> {
        if applied.replayed {
            return self.replay(applied).await;
        }
        if let Some(job) = &applied.outbox {
            self.publish(job.clone()).await?;
        }
        Ok(reason)
    }

    async fn publish(&self, job: JobEnvelope) -> Result<(), LoopError> {
        let topic = self.config.topics.for_stage(job.kind());
        debug!(job_id = %job.job_id, topic, attempt = job.attempt, "publishing job");
        self.ports.channel.publish(topic, job).await?;
        Ok(())
    }

    fn emit_metrics(&self, agent_id: &AgentId, stage: Stage, metrics: ProviderMetrics) {
        self.ports.telemetry.emit(LoopEvent::AgentCost {
            agent_id: agent_id.clone(),
            stage,
            amount: metrics.cost_units,
        });
        self.ports.telemetry.emit(LoopEvent::AgentLatency {
            agent_id: agent_id.clone(),
            stage,
            ms: metrics.latency_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::error::{ChannelError, ProviderError};
    use crate::provider::{MockJudge, MockRefiner, MockScorer, ProviderResponse};
    use crate::store::{InMemoryVersionStore, MockVersionStore};
    use crate::telemetry::RecordingTelemetry;
    use crate::transcripts::InMemoryTranscripts;
    use crate::types::EpisodeStatus;
    use autonomic_model::{
        JobId, ModelParameters, Persona, PromptStructure, Role, RuleId, Rubric, Rule, Rulebook,
        Transcript, Turn,
    };

    struct Harness {
        coordinator: LoopCoordinator,
        store: Arc<InMemoryVersionStore>,
        channel: Arc<InMemoryChannel>,
        telemetry: Arc<RecordingTelemetry>,
    }

    impl Harness {
        fn tracker(&self) -> &EpisodeTracker {
            self.coordinator.tracker()
        }

        fn last_on(&self, stage: Stage) -> JobEnvelope {
            let topic = self.coordinator.config().topics.for_stage(stage);
            self.channel
                .published(topic)
                .last()
                .cloned()
                .expect("job published")
        }

        fn count_on(&self, stage: Stage) -> usize {
            let topic = self.coordinator.config().topics.for_stage(stage);
            self.channel.published(topic).len()
        }
    }

    fn agent() -> AgentId {
        AgentId::from("billing-bot")
    }

    fn v1() -> AgentConfig {
        AgentConfig::initial(
            agent(),
            ModelParameters::default(),
            PromptStructure {
                persona: Persona {
                    role: "billing assistant".into(),
                    tone: "friendly".into(),
                },
                objectives: vec!["Answer billing questions".into()],
                ..PromptStructure::default()
            },
            Rulebook::new(vec![Rule::new("R1", "Never promise a refund")]),
            Rubric::new(vec!["The refund promise is gone".into()]),
        )
    }

    fn improved(current: &AgentConfig) -> AgentConfig {
        let mut prompt = current.prompt.clone();
        prompt
            .operational_guidelines
            .push("Refunds are decided by the billing team; never promise one".into());
        current.successor(prompt, "Refinement fix for: refund promise", None)
    }

    fn flagged() -> Transcript {
        Transcript::new(
            TranscriptRef::from("chat-1"),
            agent(),
            vec![
                Turn::new(Role::User, "Can I get my money back?"),
                Turn::new(Role::Agent, "Absolutely, a full refund is guaranteed!"),
            ],
        )
    }

    fn cost() -> ProviderMetrics {
        ProviderMetrics::new(0.01, 12)
    }

    fn failing_scorer(times: usize) -> MockScorer {
        let mut scorer = MockScorer::new();
        scorer.expect_score().times(times).returning(|_, _| {
            Ok(ProviderResponse::new(
                Verdict::fail("promised a refund", vec![RuleId::new("R1")]),
                cost(),
            ))
        });
        scorer
    }

    fn fixing_refiner() -> MockRefiner {
        let mut refiner = MockRefiner::new();
        refiner
            .expect_refine()
            .returning(|_, _, current| Ok(ProviderResponse::new(improved(current), cost())));
        refiner
    }

    fn judge(passes: bool) -> MockJudge {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().returning(move |_, _, _, _| {
            let verdict = if passes {
                Verdict::pass("fix verified")
            } else {
                Verdict::fail("still promises refunds", vec![RuleId::new("R1")])
            };
            Ok(ProviderResponse::new(verdict, cost()))
        });
        judge
    }

    fn build(store: Arc<dyn VersionStore>, providers: Providers) -> (LoopCoordinator, Arc<InMemoryChannel>, Arc<RecordingTelemetry>) {
        build_with(store, providers, Arc::new(EpisodeTracker::new()))
    }

    fn build_with(
        store: Arc<dyn VersionStore>,
        providers: Providers,
        tracker: Arc<EpisodeTracker>,
    ) -> (LoopCoordinator, Arc<InMemoryChannel>, Arc<RecordingTelemetry>) {
        let transcripts = Arc::new(InMemoryTranscripts::new());
        transcripts.insert(flagged());
        let channel = Arc::new(InMemoryChannel::default());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let ports = LoopPorts {
            store,
            transcripts,
            providers,
            channel: channel.clone(),
            telemetry: telemetry.clone(),
        };
        let coordinator = LoopCoordinator::new(LoopConfig::default(), tracker, ports);
        (coordinator, channel, telemetry)
    }

    fn harness(scorer: MockScorer, refiner: MockRefiner, judge: MockJudge) -> Harness {
        let store = Arc::new(InMemoryVersionStore::new());
        store.seed(v1());
        let providers = Providers::new(Arc::new(scorer), Arc::new(refiner), Arc::new(judge));
        let (coordinator, channel, telemetry) = build(store.clone(), providers);
        Harness {
            coordinator,
            store,
            channel,
            telemetry,
        }
    }

    fn audit_job() -> JobEnvelope {
        JobEnvelope::audit(agent(), TranscriptRef::from("chat-1"), 1)
    }

    async fn ack(h: &Harness, job: &JobEnvelope) -> AckReason {
        match h.coordinator.handle(job).await {
            Ok(Disposition::Ack(reason)) => reason,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn passing_audit_opens_nothing() {
        let mut scorer = MockScorer::new();
        scorer
            .expect_score()
            .times(1)
            .returning(|_, _| Ok(ProviderResponse::new(Verdict::pass("polite and accurate"), cost())));
        let h = harness(scorer, MockRefiner::new(), MockJudge::new());

        assert_eq!(ack(&h, &audit_job()).await, AckReason::AuditPassed);
        assert!(h.tracker().is_empty());
        assert_eq!(h.count_on(Stage::Refine), 0);
        assert_eq!(h.telemetry.count("audit.verdict"), 1);
        assert_eq!(h.telemetry.count("agent.cost"), 1);
    }

    #[tokio::test]
    async fn failed_audit_opens_episode_and_issues_refine() {
        let h = harness(failing_scorer(1), MockRefiner::new(), MockJudge::new());
        let audit = audit_job();

        assert_eq!(ack(&h, &audit).await, AckReason::Advanced);
        let episode = h.tracker().open_episode_for(&agent()).expect("episode open");
        assert_eq!(episode.stage, Stage::Refine);
        assert_eq!(episode.attempts_used, 0);
        assert_eq!(episode.origin_job, audit.job_id);

        let refine = h.last_on(Stage::Refine);
        assert_eq!(refine.episode_id, Some(episode.episode_id));
        assert_eq!(refine.attempt, 1);
        assert_eq!(refine.parent_job_id, Some(audit.job_id));
    }

    #[tokio::test]
    async fn redelivered_audit_republishes_without_rescoring() {
        let h = harness(failing_scorer(1), MockRefiner::new(), MockJudge::new());
        let audit = audit_job();

        ack(&h, &audit).await;
        assert_eq!(ack(&h, &audit).await, AckReason::Replayed);
        let published = h.channel.published(h.coordinator.config().topics.for_stage(Stage::Refine));
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].job_id, published[1].job_id);
        assert_eq!(h.tracker().len(), 1);
        assert_eq!(h.telemetry.count("audit.verdict"), 1);
    }

    #[tokio::test]
    async fn second_failure_is_suppressed_while_episode_open() {
        let h = harness(failing_scorer(2), MockRefiner::new(), MockJudge::new());

        ack(&h, &audit_job()).await;
        assert_eq!(ack(&h, &audit_job()).await, AckReason::Suppressed);
        assert_eq!(h.tracker().len(), 1);
        assert_eq!(h.count_on(Stage::Refine), 1);
    }

    #[tokio::test]
    async fn accepted_candidate_is_deployed() {
        let h = harness(failing_scorer(1), fixing_refiner(), judge(true));

        ack(&h, &audit_job()).await;
        assert_eq!(ack(&h, &h.last_on(Stage::Refine)).await, AckReason::Advanced);
        let evaluate = h.last_on(Stage::Evaluate);
        assert_eq!(evaluate.candidate().map(|c| c.version), Some(2));
        assert_eq!(ack(&h, &evaluate).await, AckReason::Succeeded);

        let episode_id = evaluate.episode_id.expect("episode id");
        let latest = h.store.get_latest(&agent()).await.unwrap();
        assert_eq!(latest.version, 2);
        assert!(latest.committed_by(episode_id));

        let episode = h.tracker().get(episode_id).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Succeeded);
        assert_eq!(episode.outcome, Some(Outcome::Succeeded { version: 2 }));
        assert!(!h.tracker().is_open(&agent()));
        assert_eq!(h.telemetry.count("deployment.success"), 1);

        // redelivery after close changes nothing
        assert_eq!(ack(&h, &evaluate).await, AckReason::Replayed);
        assert_eq!(h.store.history(&agent()).await.unwrap().len(), 2);
        assert_eq!(h.telemetry.count("deployment.success"), 1);
    }

    #[tokio::test]
    async fn commit_conflict_rebases_onto_latest() {
        let h = harness(failing_scorer(1), fixing_refiner(), judge(true));

        ack(&h, &audit_job()).await;
        ack(&h, &h.last_on(Stage::Refine)).await;
        let evaluate = h.last_on(Stage::Evaluate);

        // an operator edit lands while the candidate is being judged
        let manual = v1().successor(v1().prompt, "manual edit", None);
        h.store.append(&agent(), manual, 1).await.unwrap();

        assert_eq!(ack(&h, &evaluate).await, AckReason::Succeeded);
        let latest = h.store.get_latest(&agent()).await.unwrap();
        assert_eq!(latest.version, 3);
        assert!(latest.committed_by(evaluate.episode_id.unwrap()));
    }

    #[tokio::test]
    async fn commit_conflict_with_changed_rulebook_escalates() {
        let h = harness(failing_scorer(1), fixing_refiner(), judge(true));

        ack(&h, &audit_job()).await;
        ack(&h, &h.last_on(Stage::Refine)).await;
        let evaluate = h.last_on(Stage::Evaluate);

        // an operator adds a rule while the candidate is being judged
        let mut edited = v1().successor(v1().prompt, "operator rule", None);
        edited
            .rulebook
            .rules
            .push(Rule::new("R2", "Always quote the refund policy"));
        h.store.append(&agent(), edited, 1).await.unwrap();

        assert_eq!(ack(&h, &evaluate).await, AckReason::Escalated);
        let latest = h.store.get_latest(&agent()).await.unwrap();
        assert_eq!(latest.version, 2);
        assert!(latest.rulebook.rules.iter().any(|r| r.id == RuleId::new("R2")));
        assert!(!latest.committed_by(evaluate.episode_id.unwrap()));

        let episode = h.tracker().get(evaluate.episode_id.unwrap()).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Escalated);
        assert!(matches!(episode.outcome, Some(Outcome::Escalated { ref reason }) if reason == "version conflict"));
        assert_eq!(h.telemetry.count("deployment.success"), 0);
    }

    #[tokio::test]
    async fn evaluate_after_landed_commit_skips_judge() {
        let mut no_judge = MockJudge::new();
        no_judge.expect_evaluate().times(0);
        let h = harness(failing_scorer(1), fixing_refiner(), no_judge);

        ack(&h, &audit_job()).await;
        ack(&h, &h.last_on(Stage::Refine)).await;
        let evaluate = h.last_on(Stage::Evaluate);

        // a previous delivery committed, then died before closing the episode
        let candidate = evaluate.candidate().unwrap().rebased_on(1);
        h.store.append(&agent(), candidate, 1).await.unwrap();

        assert_eq!(ack(&h, &evaluate).await, AckReason::Succeeded);
        assert_eq!(h.store.history(&agent()).await.unwrap().len(), 2);
        let episode = h.tracker().get(evaluate.episode_id.unwrap()).unwrap();
        assert_eq!(episode.outcome, Some(Outcome::Succeeded { version: 2 }));
    }

    #[tokio::test]
    async fn rejected_candidates_retry_then_escalate() {
        let h = harness(failing_scorer(1), fixing_refiner(), judge(false));

        ack(&h, &audit_job()).await;
        ack(&h, &h.last_on(Stage::Refine)).await;
        assert_eq!(ack(&h, &h.last_on(Stage::Evaluate)).await, AckReason::Retrying);

        let retry = h.last_on(Stage::Refine);
        assert_eq!(retry.attempt, 2);
        let episode = h.tracker().get(retry.episode_id.unwrap()).unwrap();
        assert_eq!(episode.attempts_used, 1);
        assert_eq!(episode.stage, Stage::Refine);

        ack(&h, &retry).await;
        assert_eq!(ack(&h, &h.last_on(Stage::Evaluate)).await, AckReason::Escalated);

        let episode = h.tracker().get(episode.episode_id).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Escalated);
        assert_eq!(episode.attempts_used, 2);
        assert!(matches!(episode.outcome, Some(Outcome::Escalated { ref reason }) if reason == "still promises refunds"));
        assert_eq!(h.store.get_latest(&agent()).await.unwrap().version, 1);
        assert_eq!(h.telemetry.count("optimization.failed"), 1);
        assert_eq!(h.telemetry.count("deployment.success"), 0);
    }

    #[tokio::test]
    async fn invalid_candidate_consumes_an_attempt() {
        let mut refiner = MockRefiner::new();
        refiner
            .expect_refine()
            .times(1)
            .returning(|_, _, current| Ok(ProviderResponse::new(current.clone(), cost())));
        let h = harness(failing_scorer(1), refiner, MockJudge::new());

        ack(&h, &audit_job()).await;
        assert_eq!(ack(&h, &h.last_on(Stage::Refine)).await, AckReason::Retrying);

        assert_eq!(h.count_on(Stage::Evaluate), 0);
        let retry = h.last_on(Stage::Refine);
        assert_eq!(retry.attempt, 2);
        let episode = h.tracker().get(retry.episode_id.unwrap()).unwrap();
        assert_eq!(episode.attempts_used, 1);
        assert!(episode.last_failure().is_some_and(|v| v.rationale.contains("identical")));
    }

    #[tokio::test]
    async fn superseded_refine_is_dropped_as_stale() {
        let h = harness(failing_scorer(1), fixing_refiner(), judge(false));

        ack(&h, &audit_job()).await;
        let first_refine = h.last_on(Stage::Refine);
        ack(&h, &first_refine).await;
        ack(&h, &h.last_on(Stage::Evaluate)).await;

        assert_eq!(ack(&h, &first_refine).await, AckReason::Stale);
        assert_eq!(h.count_on(Stage::Evaluate), 1);
    }

    #[tokio::test]
    async fn abandoned_refine_fails_the_episode() {
        let h = harness(failing_scorer(1), MockRefiner::new(), MockJudge::new());

        ack(&h, &audit_job()).await;
        let refine = h.last_on(Stage::Refine);
        let err = LoopError::from(ProviderError::Status {
            status: 400,
            body: "bad request".into(),
        });
        h.coordinator.abandon(&refine, &err);

        let episode = h.tracker().get(refine.episode_id.unwrap()).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(!h.tracker().is_open(&agent()));

        // a second abandon of the same job is a replay
        h.coordinator.abandon(&refine, &err);
        assert_eq!(h.tracker().get(episode.episode_id).unwrap().status, EpisodeStatus::Failed);
    }

    #[tokio::test]
    async fn undeliverable_refine_fails_the_episode() {
        let h = harness(failing_scorer(1), MockRefiner::new(), MockJudge::new());
        let audit = audit_job();
        h.channel.close();

        let err = h.coordinator.handle(&audit).await.unwrap_err();
        assert!(matches!(err, LoopError::Channel(ChannelError::Closed)));
        h.coordinator.abandon(&audit, &err);

        let episode = h.tracker().episode_for_origin(audit.job_id).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(matches!(
            episode.outcome,
            Some(Outcome::Failed { ref reason }) if reason.starts_with("follow-up job not delivered")
        ));
        assert!(!h.tracker().is_open(&agent()));
    }

    #[tokio::test]
    async fn restored_episode_resumes_to_completion() {
        let h = harness(failing_scorer(1), MockRefiner::new(), MockJudge::new());
        ack(&h, &audit_job()).await;
        let snapshot = h.tracker().snapshot();

        // restart: same store, empty channel, tracker rebuilt from the snapshot
        let tracker = Arc::new(EpisodeTracker::restore(snapshot).unwrap());
        let providers = Providers::new(
            Arc::new(MockScorer::new()),
            Arc::new(fixing_refiner()),
            Arc::new(judge(true)),
        );
        let (coordinator, channel, telemetry) = build_with(h.store.clone(), providers, tracker);
        let restarted = Harness {
            coordinator,
            store: h.store.clone(),
            channel,
            telemetry,
        };

        assert_eq!(restarted.coordinator.resume_open().await.unwrap(), 1);
        let refine = restarted.last_on(Stage::Refine);
        assert_eq!(refine.job_id, h.last_on(Stage::Refine).job_id);
        assert_eq!(ack(&restarted, &refine).await, AckReason::Advanced);
        assert_eq!(
            ack(&restarted, &restarted.last_on(Stage::Evaluate)).await,
            AckReason::Succeeded
        );

        let episode = restarted.tracker().get(refine.episode_id.unwrap()).unwrap();
        assert_eq!(episode.outcome, Some(Outcome::Succeeded { version: 2 }));
        assert!(!restarted.tracker().is_open(&agent()));
        assert_eq!(restarted.telemetry.count("deployment.success"), 1);
    }

    #[tokio::test]
    async fn restored_episode_without_pending_job_is_failed() {
        let tracker = Arc::new(EpisodeTracker::new());
        let id = tracker
            .try_open(OpenRequest {
                agent_id: agent(),
                transcript_ref: TranscriptRef::from("chat-1"),
                origin_job: JobId::new(),
                base_version: 1,
                max_attempts: 2,
            })
            .episode_id();
        let providers = Providers::new(
            Arc::new(MockScorer::new()),
            Arc::new(MockRefiner::new()),
            Arc::new(MockJudge::new()),
        );
        let (coordinator, channel, _) =
            build_with(Arc::new(InMemoryVersionStore::new()), providers, tracker);

        assert_eq!(coordinator.resume_open().await.unwrap(), 0);
        let episode = coordinator.tracker().get(id).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(!coordinator.tracker().is_open(&agent()));
        assert!(channel
            .published(coordinator.config().topics.for_stage(Stage::Refine))
            .is_empty());
    }

    #[tokio::test]
    async fn transient_provider_failure_asks_for_redelivery() {
        let mut scorer = MockScorer::new();
        scorer
            .expect_score()
            .returning(|_, _| Err(ProviderError::Timeout { timeout_ms: 30_000 }));
        let h = harness(scorer, MockRefiner::new(), MockJudge::new());

        let result = h.coordinator.handle(&audit_job()).await;
        assert!(matches!(result, Ok(Disposition::Retry(LoopError::Provider(_)))));
        assert!(h.tracker().is_empty());
    }

    #[tokio::test]
    async fn permanent_provider_failure_is_returned() {
        let mut scorer = MockScorer::new();
        scorer.expect_score().returning(|_, _| {
            Err(ProviderError::Status {
                status: 401,
                body: "unauthorized".into(),
            })
        });
        let h = harness(scorer, MockRefiner::new(), MockJudge::new());

        let err = h.coordinator.handle(&audit_job()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn store_outage_asks_for_redelivery() {
        let mut store = MockVersionStore::new();
        store
            .expect_get_latest()
            .returning(|_| Err(StoreError::Unavailable("connection refused".into())));
        let providers = Providers::new(
            Arc::new(MockScorer::new()),
            Arc::new(MockRefiner::new()),
            Arc::new(MockJudge::new()),
        );
        let (coordinator, _, _) = build(Arc::new(store), providers);

        let result = coordinator.handle(&audit_job()).await;
        assert!(matches!(
            result,
            Ok(Disposition::Retry(LoopError::Store(StoreError::Unavailable(_))))
        ));
    }

    #[tokio::test]
    async fn submit_audit_stamps_current_version() {
        let h = harness(MockScorer::new(), MockRefiner::new(), MockJudge::new());
        let job = h
            .coordinator
            .submit_audit(agent(), TranscriptRef::from("chat-1"))
            .await
            .unwrap();
        assert_eq!(job.config_version, 1);
        assert_eq!(h.last_on(Stage::Audit).job_id, job.job_id);
    }
}
