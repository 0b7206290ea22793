//! Verdicts produced by scoring and evaluation

use crate::ids::RuleId;
use crate::validation::ValidationError;
use serde::{Deserialize, Serialize};

/// Severity assigned by the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    /// Hallucinations and scope-safety violations
    High,
}

/// Cost and latency reported by a capability provider call
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// Provider-defined cost units (currency for model-backed providers)
    pub cost_units: f64,
    /// Wall-clock latency in milliseconds
    pub latency_ms: u64,
}

impl ProviderMetrics {
    #[inline]
    #[must_use]
    pub fn new(cost_units: f64, latency_ms: u64) -> Self {
        Self {
            cost_units,
            latency_ms,
        }
    }

    /// Sum of two calls made for one logical operation
    #[inline]
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self {
            cost_units: self.cost_units + other.cost_units,
            latency_ms: self.latency_ms + other.latency_ms,
        }
    }
}

/// Outcome of scoring a transcript or judging a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default)]
    pub violated_rules: Vec<RuleId>,
    pub rationale: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metrics: ProviderMetrics,
}

impl Verdict {
    #[must_use]
    pub fn pass(rationale: impl Into<String>) -> Self {
        Self {
            passed: true,
            violated_rules: Vec::new(),
            rationale: rationale.into(),
            priority: Priority::Low,
            metrics: ProviderMetrics::default(),
        }
    }

    #[must_use]
    pub fn fail(rationale: impl Into<String>, violated_rules: Vec<RuleId>) -> Self {
        Self {
            passed: false,
            violated_rules,
            rationale: rationale.into(),
            priority: Priority::Medium,
            metrics: ProviderMetrics::default(),
        }
    }

    /// Failing verdict recorded for a candidate that failed local validation
    #[must_use]
    pub fn structural_failure(error: &ValidationError) -> Self {
        Self {
            passed: false,
            violated_rules: Vec::new(),
            rationale: format!("structurally invalid candidate: {error}"),
            priority: Priority::High,
            metrics: ProviderMetrics::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_metrics(mut self, metrics: ProviderMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_defaults_to_medium_priority() {
        let v = Verdict::fail("missed lead", vec![RuleId::from("R2")]);
        assert!(!v.passed);
        assert_eq!(v.priority, Priority::Medium);
        assert_eq!(v.violated_rules, vec![RuleId::from("R2")]);
    }

    #[test]
    fn structural_failure_is_high_priority() {
        let v = Verdict::structural_failure(&ValidationError::EmptyPrompt);
        assert!(!v.passed);
        assert_eq!(v.priority, Priority::High);
        assert!(v.rationale.contains("empty prompt"));
    }

    #[test]
    fn priority_uses_uppercase_wire_names() {
        let v: Verdict = serde_json::from_str(
            r#"{"passed": false, "rationale": "hallucinated inventory", "priority": "HIGH"}"#,
        )
        .unwrap();
        assert_eq!(v.priority, Priority::High);
        assert!(v.violated_rules.is_empty());
    }

    #[test]
    fn metrics_combine() {
        let m = ProviderMetrics::new(0.001, 120).combine(ProviderMetrics::new(0.002, 80));
        assert_eq!(m.latency_ms, 200);
        assert!((m.cost_units - 0.003).abs() < 1e-12);
    }
}
