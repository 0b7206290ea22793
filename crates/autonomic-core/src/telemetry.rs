//! Telemetry events
//!
//! The loop emits structured events; forwarding them to a backend is the
//! sink's concern. [`MetricsTelemetry`] records them through the `metrics`
//! facade and `tracing`; [`RecordingTelemetry`] keeps them for inspection.

use crate::types::Stage;
use autonomic_model::{AgentId, EpisodeId, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Structured event emitted by the loop
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    AuditVerdict {
        agent_id: AgentId,
        passed: bool,
        priority: Priority,
    },
    /// Budget exhausted; carries what a human needs to open a case
    OptimizationFailed {
        agent_id: AgentId,
        episode_id: EpisodeId,
        reason: String,
    },
    DeploymentSuccess {
        agent_id: AgentId,
        episode_id: EpisodeId,
        version: u64,
    },
    AgentCost {
        agent_id: AgentId,
        stage: Stage,
        amount: f64,
    },
    AgentLatency {
        agent_id: AgentId,
        stage: Stage,
        ms: u64,
    },
}

impl LoopEvent {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuditVerdict { .. } => "audit.verdict",
            Self::OptimizationFailed { .. } => "optimization.failed",
            Self::DeploymentSuccess { .. } => "deployment.success",
            Self::AgentCost { .. } => "agent.cost",
            Self::AgentLatency { .. } => "agent.latency",
        }
    }

    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::AuditVerdict { agent_id, .. }
            | Self::OptimizationFailed { agent_id, .. }
            | Self::DeploymentSuccess { agent_id, .. }
            | Self::AgentCost { agent_id, .. }
            | Self::AgentLatency { agent_id, .. } => agent_id,
        }
    }
}

/// Receiver of loop events
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: LoopEvent);
}

/// Sink backed by the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl MetricsTelemetry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySink for MetricsTelemetry {
    #[allow(clippy::cast_precision_loss)]
    fn emit(&self, event: LoopEvent) {
        let agent = event.agent_id().to_string();
        match &event {
            LoopEvent::AuditVerdict {
                passed, priority, ..
            } => {
                let verdict = if *passed { "pass" } else { "fail" };
                metrics::counter!("autonomic.audit.verdict", "agent_id" => agent.clone(), "verdict" => verdict)
                    .increment(1);
                info!(event = event.name(), agent_id = %agent, verdict, priority = ?priority, "audit verdict");
            }
            LoopEvent::OptimizationFailed {
                episode_id, reason, ..
            } => {
                metrics::counter!("autonomic.optimization.failed", "agent_id" => agent.clone()).increment(1);
                warn!(event = event.name(), agent_id = %agent, episode_id = %episode_id, reason = %reason, "optimization failed, human review required");
            }
            LoopEvent::DeploymentSuccess {
                episode_id, version, ..
            } => {
                metrics::counter!("autonomic.deployments.success", "agent_id" => agent.clone()).increment(1);
                info!(event = event.name(), agent_id = %agent, episode_id = %episode_id, version, "deployment succeeded");
            }
            LoopEvent::AgentCost { stage, amount, .. } => {
                metrics::gauge!("autonomic.backend.cost", "agent_id" => agent.clone(), "stage" => stage.as_str())
                    .increment(*amount);
            }
            LoopEvent::AgentLatency { stage, ms, .. } => {
                metrics::histogram!("autonomic.stage.latency_ms", "agent_id" => agent.clone(), "stage" => stage.as_str())
                    .record(*ms as f64);
            }
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<LoopEvent>>,
}

impl RecordingTelemetry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<LoopEvent> {
        self.events.lock().clone()
    }

    /// Events with the given wire name
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<LoopEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: LoopEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        let agent = AgentId::from("x");
        let episode = EpisodeId::new();
        assert_eq!(
            LoopEvent::OptimizationFailed {
                agent_id: agent.clone(),
                episode_id: episode,
                reason: "judge rejected fix".into(),
            }
            .name(),
            "optimization.failed"
        );
        assert_eq!(
            LoopEvent::DeploymentSuccess {
                agent_id: agent,
                episode_id: episode,
                version: 2,
            }
            .name(),
            "deployment.success"
        );
    }

    #[test]
    fn recording_sink_filters_by_name() {
        let sink = RecordingTelemetry::new();
        let agent = AgentId::from("x");
        sink.emit(LoopEvent::AuditVerdict {
            agent_id: agent.clone(),
            passed: false,
            priority: Priority::High,
        });
        sink.emit(LoopEvent::AgentLatency {
            agent_id: agent,
            stage: Stage::Audit,
            ms: 40,
        });
        assert_eq!(sink.count("audit.verdict"), 1);
        assert_eq!(sink.named("agent.latency").len(), 1);
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn metrics_sink_without_recorder_is_a_no_op() {
        MetricsTelemetry::new().emit(LoopEvent::AgentCost {
            agent_id: AgentId::from("x"),
            stage: Stage::Evaluate,
            amount: 0.002,
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(LoopEvent::DeploymentSuccess {
            agent_id: AgentId::from("x"),
            episode_id: EpisodeId::new(),
            version: 3,
        })
        .unwrap();
        assert_eq!(json["event"], "deployment_success");
        assert_eq!(json["version"], 3);
    }
}
