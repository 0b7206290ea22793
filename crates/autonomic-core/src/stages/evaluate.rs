//! Evaluate: judge a candidate in a sandbox replay

use crate::error::ProviderError;
use crate::provider::{with_timeout, Judge};
use autonomic_model::{AgentConfig, Rulebook, Transcript, Verdict};
use std::time::Duration;

/// Judge `candidate` against the flagged transcript
///
/// The rubric and rulebook come from `current`, the configuration the
/// candidate would replace, so a candidate cannot grade itself on rules it
/// rewrote.
///
/// # Errors
/// Returns the provider error, including `ProviderError::Timeout`
pub async fn run(
    judge: &dyn Judge,
    candidate: &AgentConfig,
    transcript: &Transcript,
    current: &AgentConfig,
    timeout: Duration,
) -> Result<Verdict, ProviderError> {
    let rulebook = Rulebook::new(current.rulebook.effective_rules());
    let response = with_timeout(
        timeout,
        judge.evaluate(candidate, transcript, &current.rubric, &rulebook),
    )
    .await?;
    Ok(response.value.with_metrics(response.metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockJudge, ProviderResponse};
    use autonomic_model::{
        AgentId, ModelParameters, PromptStructure, ProviderMetrics, Rubric, TranscriptRef,
    };

    fn config(criteria: &str) -> AgentConfig {
        AgentConfig::initial(
            AgentId::from("x"),
            ModelParameters::default(),
            PromptStructure::default(),
            Rulebook::default(),
            Rubric::new(vec![criteria.to_string()]),
        )
    }

    #[tokio::test]
    async fn judges_with_current_rubric() {
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .withf(|_, _, rubric, _| rubric.criteria == vec!["Captures contact details".to_string()])
            .returning(|_, _, _, _| {
                Ok(ProviderResponse::new(Verdict::pass("fixed"), ProviderMetrics::new(0.02, 1200)))
            });

        let mut candidate = config("self-graded");
        candidate.version = 2;
        let transcript = Transcript::new(TranscriptRef::from("c"), AgentId::from("x"), vec![]);
        let verdict = run(
            &judge,
            &candidate,
            &transcript,
            &config("Captures contact details"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(verdict.passed);
        assert!((verdict.metrics.cost_units - 0.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn judge_transport_error_is_transient() {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().returning(|_, _, _, _| {
            Err(ProviderError::Transport("connection reset".into()))
        });
        let transcript = Transcript::new(TranscriptRef::from("c"), AgentId::from("x"), vec![]);
        let err = run(
            &judge,
            &config("a"),
            &transcript,
            &config("a"),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}
