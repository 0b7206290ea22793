//! Parsing of model-backed provider output

use crate::error::ProviderError;
use autonomic_model::{Priority, RuleId, Verdict};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Remove a surrounding Markdown code fence, if any
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") on the opening line
    let body = rest.find('\n').map_or(rest, |nl| &rest[nl + 1..]);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse a JSON payload, tolerating a code fence around it
///
/// # Errors
/// Returns `ProviderError::Malformed` if the text is not the expected JSON
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ProviderError> {
    serde_json::from_str(strip_code_fences(text)).map_err(|e| ProviderError::Malformed(e.to_string()))
}

/// Verdict as returned by a scoring or judging model
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawVerdict {
    /// "PASS" or "FAIL"
    pub verdict: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub violated_rules: Vec<RuleId>,
}

impl RawVerdict {
    /// Convert to a [`Verdict`]; anything but "PASS" is a failure
    #[must_use]
    pub fn into_verdict(self) -> Verdict {
        let passed = self.verdict.trim().eq_ignore_ascii_case("pass");
        let verdict = if passed {
            Verdict::pass(self.reason)
        } else {
            Verdict::fail(self.reason, self.violated_rules)
        };
        match self.priority {
            Some(priority) => verdict.with_priority(priority),
            None => verdict,
        }
    }
}

/// Parse a `{"verdict": "PASS"|"FAIL", "reason": ..}` reply
///
/// # Errors
/// Returns `ProviderError::Malformed` if the reply is not such an object
pub fn parse_verdict(text: &str) -> Result<Verdict, ProviderError> {
    parse_json::<RawVerdict>(text).map(RawVerdict::into_verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```\n"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parses_fail_verdict_with_priority() {
        let v = parse_verdict(
            "```json\n{\"verdict\": \"FAIL\", \"reason\": \"Hallucinated: 2024 Model X\", \"priority\": \"HIGH\"}\n```",
        )
        .unwrap();
        assert!(!v.passed);
        assert_eq!(v.priority, Priority::High);
        assert_eq!(v.rationale, "Hallucinated: 2024 Model X");
    }

    #[test]
    fn unknown_verdict_word_is_a_failure() {
        let v = parse_verdict(r#"{"verdict": "MAYBE", "reason": "unsure"}"#).unwrap();
        assert!(!v.passed);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_verdict("I think it passed."),
            Err(ProviderError::Malformed(_))
        ));
    }
}
