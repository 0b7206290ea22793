//! Audit: score a live transcript against the current rulebook

use crate::error::ProviderError;
use crate::provider::{with_timeout, Scorer};
use autonomic_model::{AgentConfig, Rulebook, Transcript, Verdict};
use std::time::Duration;

/// Score `transcript` against `config`'s rulebook
///
/// An empty rulebook is audited with the default rule. The returned verdict
/// carries the provider's cost and latency.
///
/// # Errors
/// Returns the provider error, including `ProviderError::Timeout`
pub async fn run(
    scorer: &dyn Scorer,
    transcript: &Transcript,
    config: &AgentConfig,
    timeout: Duration,
) -> Result<Verdict, ProviderError> {
    let rulebook = Rulebook::new(config.rulebook.effective_rules());
    let response = with_timeout(timeout, scorer.score(transcript, &rulebook)).await?;
    Ok(response.value.with_metrics(response.metrics))
}
