//! Capability providers
//!
//! Scoring, refinement and judging are opaque external services. The loop
//! owns their timeouts; retries happen through channel redelivery.

mod http;
mod parse;

pub use http::{CompletionRequest, CompletionUsage, HttpCapabilityProvider, HttpProviderConfig};
pub use parse::{parse_json, parse_verdict, strip_code_fences, RawVerdict};

use crate::error::ProviderError;
use async_trait::async_trait;
use autonomic_model::{AgentConfig, ProviderMetrics, Rubric, Rulebook, Transcript, Verdict};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Provider result with its cost / latency signal
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse<T> {
    pub value: T,
    pub metrics: ProviderMetrics,
}

impl<T> ProviderResponse<T> {
    #[inline]
    #[must_use]
    pub fn new(value: T, metrics: ProviderMetrics) -> Self {
        Self { value, metrics }
    }
}

/// Scores a transcript against a rulebook
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        transcript: &Transcript,
        rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError>;
}

/// Synthesizes a candidate configuration from a failing verdict
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(
        &self,
        transcript: &Transcript,
        verdict: &Verdict,
        current: &AgentConfig,
    ) -> Result<ProviderResponse<AgentConfig>, ProviderError>;
}

/// Judges a candidate by replaying the flagged transcript in a sandbox
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Judge: Send + Sync {
    /// `rubric` and `rulebook` come from the current (pre-candidate) config
    async fn evaluate(
        &self,
        candidate: &AgentConfig,
        transcript: &Transcript,
        rubric: &Rubric,
        rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError>;
}

/// The three capability providers used by the loop
#[derive(Clone)]
pub struct Providers {
    pub scorer: Arc<dyn Scorer>,
    pub refiner: Arc<dyn Refiner>,
    pub judge: Arc<dyn Judge>,
}

impl Providers {
    #[inline]
    #[must_use]
    pub fn new(scorer: Arc<dyn Scorer>, refiner: Arc<dyn Refiner>, judge: Arc<dyn Judge>) -> Self {
        Self {
            scorer,
            refiner,
            judge,
        }
    }

    /// One backend serving all three capabilities
    #[must_use]
    pub fn uniform<P>(provider: Arc<P>) -> Self
    where
        P: Scorer + Refiner + Judge + 'static,
    {
        Self {
            scorer: provider.clone(),
            refiner: provider.clone(),
            judge: provider,
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

/// Run a provider call under `timeout`
///
/// # Errors
/// Returns `ProviderError::Timeout` if the call does not finish in time, or
/// the call's own error
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<ProviderResponse<T>, ProviderError>
where
    F: Future<Output = Result<ProviderResponse<T>, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autonomic_model::{AgentId, TranscriptRef};

    fn transcript() -> Transcript {
        Transcript::new(TranscriptRef::from("chat-1"), AgentId::from("x"), vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let result: Result<ProviderResponse<()>, _> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProviderResponse::new((), ProviderMetrics::default()))
        })
        .await;
        assert_eq!(result, Err(ProviderError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn mocked_scorer_is_called_through_timeout() {
        let mut scorer = MockScorer::new();
        scorer
            .expect_score()
            .times(1)
            .returning(|_, _| Ok(ProviderResponse::new(Verdict::pass("ok"), ProviderMetrics::new(0.01, 12))));

        let t = transcript();
        let rules = Rulebook::default();
        let response = with_timeout(Duration::from_secs(1), scorer.score(&t, &rules))
            .await
            .unwrap();
        assert!(response.value.passed);
        assert_eq!(response.metrics.latency_ms, 12);
    }

    #[tokio::test]
    async fn provider_error_passes_through() {
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_, _, _, _| Err(ProviderError::Malformed("no verdict field".into())));
        let candidate = autonomic_model::AgentConfig::initial(
            AgentId::from("x"),
            autonomic_model::ModelParameters::default(),
            autonomic_model::PromptStructure::default(),
            Rulebook::default(),
            Rubric::default(),
        );
        let t = transcript();
        let err = with_timeout(
            Duration::from_secs(1),
            judge.evaluate(&candidate, &t, &Rubric::default(), &Rulebook::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
