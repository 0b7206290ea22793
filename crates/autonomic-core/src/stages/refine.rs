//! Refine: synthesize a candidate configuration and check it locally

use crate::error::ProviderError;
use crate::provider::{with_timeout, Refiner};
use autonomic_model::{
    AgentConfig, EpisodeId, ProviderMetrics, StructuralValidator, Transcript, ValidationError,
    Verdict,
};
use std::time::Duration;

/// Result of a refinement
#[derive(Debug, Clone, PartialEq)]
pub enum RefineOutcome {
    /// Well-formed candidate, ready for evaluation
    Candidate {
        candidate: AgentConfig,
        metrics: ProviderMetrics,
    },
    /// Candidate failed structural validation; `verdict` is the synthetic
    /// failing verdict to record against the budget
    Invalid {
        error: ValidationError,
        verdict: Verdict,
    },
}

/// Ask the refiner for a candidate fixing `failing`, then validate it
///
/// The candidate is stamped with `episode` as its source and numbered as
/// the successor of `current`.
///
/// # Errors
/// Returns the provider error, including `ProviderError::Timeout`
pub async fn run(
    refiner: &dyn Refiner,
    validator: &StructuralValidator,
    transcript: &Transcript,
    failing: &Verdict,
    current: &AgentConfig,
    episode: EpisodeId,
    timeout: Duration,
) -> Result<RefineOutcome, ProviderError> {
    let response = with_timeout(timeout, refiner.refine(transcript, failing, current)).await?;
    let metrics = response.metrics;

    let mut candidate = response.value;
    candidate.version = current.version + 1;
    candidate.provenance.source_episode = Some(episode);
    if candidate.provenance.reason.is_none() {
        candidate.provenance.reason = Some(failing.rationale.clone());
    }

    Ok(match validator.validate(current, &candidate) {
        Ok(()) => RefineOutcome::Candidate { candidate, metrics },
        Err(error) => RefineOutcome::Invalid {
            verdict: Verdict::structural_failure(&error).with_metrics(metrics),
            error,
        },
    })
}
