//! Local run mode
//!
//! Serves the loop against the HTTP capability provider with in-process
//! store, channel and transcripts. Audit requests arrive as JSON lines; once
//! input ends the channel is drained and the episodes are summarized.

use anyhow::Context;
use autonomic_core::{
    Episode, EpisodeTracker, HttpCapabilityProvider, InMemoryChannel, InMemoryTranscripts,
    InMemoryVersionStore, LoopConfig, LoopCoordinator, LoopPorts, MetricsTelemetry, Providers,
    WorkerPool,
};
use autonomic_model::{AgentConfig, AgentId, Role, Transcript, TranscriptRef, Turn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

/// One captured conversation to audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    pub agent_id: AgentId,
    pub transcript_ref: TranscriptRef,
    pub turns: Vec<TurnInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnInput {
    pub role: Role,
    pub text: String,
}

impl AuditRequest {
    fn into_transcript(self) -> Transcript {
        let turns = self
            .turns
            .into_iter()
            .map(|t| Turn::new(t.role, t.text))
            .collect();
        Transcript::new(self.transcript_ref, self.agent_id, turns)
    }
}

/// Settings of one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: LoopConfig,
    /// Initial configuration of every agent served
    pub agents: Vec<AgentConfig>,
    /// Tracker snapshot restored on start and written on exit
    pub snapshot: Option<PathBuf>,
    /// How long to wait for in-flight episodes after input ends
    pub drain_timeout: Duration,
}

/// What a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub submitted: usize,
    pub rejected: usize,
    pub drained: bool,
    pub episodes: Vec<Episode>,
}

impl RunSummary {
    /// One line per episode
    pub fn generate_text(&self) -> String {
        let mut out = format!(
            "submitted {} audits ({} rejected), drained: {}\n",
            self.submitted, self.rejected, self.drained
        );
        for episode in &self.episodes {
            let outcome = episode
                .outcome
                .as_ref()
                .map_or_else(|| format!("open at {}", episode.stage), |o| format!("{o:?}"));
            out.push_str(&format!(
                "{} agent={} attempts={}/{} {}\n",
                episode.episode_id, episode.agent_id, episode.attempts_used, episode.max_attempts, outcome
            ));
        }
        out
    }
}

/// Serve audit requests read from `input` until it ends
///
/// # Errors
/// Returns an error if the config is invalid, the snapshot cannot be loaded
/// or saved, or `input` cannot be read
pub async fn run<R>(options: RunOptions, input: R) -> anyhow::Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
{
    options.config.validate().context("invalid loop configuration")?;

    let tracker = match &options.snapshot {
        Some(path) if path.exists() => {
            let tracker = EpisodeTracker::load_from(path)
                .with_context(|| format!("loading tracker snapshot {}", path.display()))?;
            info!(path = %path.display(), episodes = tracker.len(), "restored episode tracker");
            tracker
        }
        _ => EpisodeTracker::new(),
    };
    let tracker = Arc::new(tracker);

    let store = Arc::new(InMemoryVersionStore::new());
    for agent in options.agents {
        store.seed(agent);
    }
    let transcripts = Arc::new(InMemoryTranscripts::new());
    let channel = Arc::new(InMemoryChannel::new(options.config.lease()).with_publish_log(0));
    let provider = Arc::new(HttpCapabilityProvider::new(options.config.provider.clone()));
    let ports = LoopPorts {
        store,
        transcripts: transcripts.clone(),
        providers: Providers::uniform(provider),
        channel: channel.clone(),
        telemetry: Arc::new(MetricsTelemetry),
    };
    let coordinator = Arc::new(LoopCoordinator::new(options.config, tracker.clone(), ports));
    let pool = WorkerPool::spawn(Arc::clone(&coordinator));

    let mut submitted = 0;
    let mut rejected = 0;
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("reading audit requests")? {
        if line.trim().is_empty() {
            continue;
        }
        let request: AuditRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "skipping malformed audit request");
                rejected += 1;
                continue;
            }
        };
        let agent_id = request.agent_id.clone();
        let transcript_ref = request.transcript_ref.clone();
        transcripts.insert(request.into_transcript());
        match coordinator.submit_audit(agent_id, transcript_ref).await {
            Ok(job) => {
                info!(job_id = %job.job_id, agent_id = %job.agent_id, "audit submitted");
                submitted += 1;
            }
            Err(e) => {
                warn!(error = %e, "audit request rejected");
                rejected += 1;
            }
        }
    }

    // transcripts live only in memory; resume once this run's requests are in
    let resumed = coordinator
        .resume_open()
        .await
        .context("resuming restored episodes")?;
    if resumed > 0 {
        info!(resumed, "republished pending jobs of restored episodes");
    }

    let drained = channel.wait_idle(options.drain_timeout).await;
    if !drained {
        warn!(timeout = ?options.drain_timeout, "stopping with jobs still in flight");
    }
    pool.shutdown().await;
    channel.close();

    if let Some(path) = &options.snapshot {
        tracker
            .save_to(path)
            .with_context(|| format!("writing tracker snapshot {}", path.display()))?;
        info!(path = %path.display(), "saved episode tracker");
    }

    let mut episodes = tracker.snapshot().episodes;
    episodes.sort_by(|a, b| (&a.agent_id, a.episode_id).cmp(&(&b.agent_id, b.episode_id)));
    Ok(RunSummary {
        submitted,
        rejected,
        drained,
        episodes,
    })
}
