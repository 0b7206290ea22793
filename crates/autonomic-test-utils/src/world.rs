use crate::fixtures::{clean_transcript, flagged_transcript, sample_config};
use crate::scripted::ScriptedProvider;
use autonomic_core::{
    Episode, EpisodeTracker, InMemoryChannel, InMemoryTranscripts, InMemoryVersionStore,
    JobEnvelope, LoopConfig, LoopCoordinator, LoopError, LoopPorts, Providers, RecordingTelemetry, Stage,
    WorkerPool,
};
use autonomic_model::{AgentConfig, AgentId, TranscriptRef};
use std::sync::Arc;
use std::time::Duration;

/// Fully wired in-process loop
pub struct World {
    pub config: LoopConfig,
    pub store: Arc<InMemoryVersionStore>,
    pub transcripts: Arc<InMemoryTranscripts>,
    pub channel: Arc<InMemoryChannel>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub tracker: Arc<EpisodeTracker>,
    pub coordinator: Arc<LoopCoordinator>,
}

impl World {
    pub fn new(config: LoopConfig, providers: Providers) -> Self {
        let store = Arc::new(InMemoryVersionStore::new());
        let transcripts = Arc::new(InMemoryTranscripts::new());
        let channel = Arc::new(InMemoryChannel::new(config.lease()));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let tracker = Arc::new(EpisodeTracker::new());
        let ports = LoopPorts {
            store: store.clone(),
            transcripts: transcripts.clone(),
            providers,
            channel: channel.clone(),
            telemetry: telemetry.clone(),
        };
        let coordinator = Arc::new(LoopCoordinator::new(config.clone(), tracker.clone(), ports));
        Self {
            config,
            store,
            transcripts,
            channel,
            telemetry,
            tracker,
            coordinator,
        }
    }

    /// Default config with one provider serving every capability
    pub fn scripted(provider: Arc<ScriptedProvider>) -> Self {
        Self::new(LoopConfig::default(), Providers::uniform(provider))
    }

    /// Seed `agent` with the sample v1 config and one flagged plus one clean
    /// transcript ("<agent>-flagged", "<agent>-clean")
    pub fn seed_agent(&self, agent: &str) -> AgentConfig {
        let agent_id = AgentId::from(agent);
        let config = sample_config(&agent_id);
        self.store.seed(config.clone());
        self.transcripts
            .insert(flagged_transcript(&agent_id, &format!("{agent}-flagged")));
        self.transcripts
            .insert(clean_transcript(&agent_id, &format!("{agent}-clean")));
        config
    }

    /// Publish an Audit job for the agent's flagged transcript
    ///
    /// # Errors
    /// Returns an error if the agent was never seeded
    pub async fn audit_flagged(&self, agent: &str) -> Result<JobEnvelope, LoopError> {
        self.coordinator
            .submit_audit(AgentId::from(agent), TranscriptRef::new(format!("{agent}-flagged")))
            .await
    }

    /// Run a worker pool until every published job is acked
    ///
    /// Returns `false` if `timeout` passes first.
    pub async fn run_until_idle(&self, timeout: Duration) -> bool {
        let pool = WorkerPool::spawn(Arc::clone(&self.coordinator));
        let idle = self.channel.wait_idle(timeout).await;
        pool.shutdown().await;
        idle
    }

    pub fn jobs_on(&self, stage: Stage) -> Vec<JobEnvelope> {
        self.channel.published(self.config.topics.for_stage(stage))
    }

    pub fn episodes(&self, agent: &str) -> Vec<Episode> {
        self.tracker.episodes_for(&AgentId::from(agent))
    }
}
