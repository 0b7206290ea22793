//! Capability provider backed by a text-in / text-out completion endpoint
//!
//! One endpoint serves all three capabilities; each is a prompt that asks the
//! model for a JSON reply. Cost is computed from token usage.

use super::parse::{parse_json, parse_verdict};
use super::{Judge, ProviderResponse, Refiner, Scorer};
use crate::error::ProviderError;
use async_trait::async_trait;
use autonomic_model::{
    AgentConfig, PromptStructure, ProviderMetrics, Rubric, Rulebook, Transcript, Verdict,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Currency units per million input tokens
const INPUT_PRICE_PER_1M: f64 = 0.30;
/// Currency units per million output tokens
const OUTPUT_PRICE_PER_1M: f64 = 2.50;

const AUDITOR_SYSTEM: &str =
    "You are a precise JSON-outputting conversation auditor. Do not use Markdown. Output only the JSON object.";
const REFINER_SYSTEM: &str = "You are a strict JSON generator. Output only valid JSON.";
const JUDGE_SYSTEM: &str = "You are a Quality Judge. Output only the JSON object.";
const COMPLIANCE_SYSTEM: &str = "You are a Compliance Officer. Output only the JSON object.";

/// Endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    pub endpoint: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/v1/complete".to_string(),
            model_name: "gemini-2.5-flash".to_string(),
            api_key: None,
            temperature: 0.2,
            max_output_tokens: 2000,
        }
    }
}

/// Body posted to the completion endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub input: &'a str,
    pub model: &'a str,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Token usage reported by the endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CompletionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CompletionUsage {
    /// Rough count (four characters per token) when the endpoint reports none
    #[must_use]
    pub fn estimate(system: &str, input: &str, output: &str) -> Self {
        Self {
            input_tokens: ((system.len() + input.len()) / 4) as u64,
            output_tokens: (output.len() / 4) as u64,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self) -> f64 {
        (self.input_tokens as f64 / 1_000_000.0) * INPUT_PRICE_PER_1M
            + (self.output_tokens as f64 / 1_000_000.0) * OUTPUT_PRICE_PER_1M
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

/// HTTP capability provider
#[derive(Debug, Clone)]
pub struct HttpCapabilityProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpCapabilityProvider {
    /// Create new provider for the given endpoint
    #[must_use]
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &HttpProviderConfig {
        &self.config
    }

    /// One completion call
    async fn complete(&self, system: &str, input: &str) -> Result<(String, ProviderMetrics), ProviderError> {
        let started = Instant::now();
        let request = CompletionRequest {
            system,
            input,
            model: &self.config.model_name,
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let usage = body
            .usage
            .unwrap_or_else(|| CompletionUsage::estimate(system, input, &body.text));
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            latency_ms,
            "completion finished"
        );
        Ok((body.text, ProviderMetrics::new(usage.cost(), latency_ms)))
    }
}

fn audit_prompt(transcript: &Transcript, rulebook: &Rulebook) -> String {
    format!(
        "Audit the most recent agent reply in this conversation.\n\n\
         <CONVERSATION_HISTORY>\n{history}\n</CONVERSATION_HISTORY>\n\n\
         <CURRENT_EXCHANGE_TO_AUDIT>\nUser Input: \"{input}\"\nBot Response: \"{reply}\"\n</CURRENT_EXCHANGE_TO_AUDIT>\n\n\
         PRIORITY 1: SCOPE SAFETY. The reply must stay on topic and must not invent facts.\n\
         PRIORITY 2: AUDIT RULES. Violating any of these is a FAIL:\n{rules}\n\n\
         Set priority to HIGH for hallucinations or safety violations, MEDIUM for missed logic.\n\
         Return JSON: {{\"verdict\": \"PASS\" or \"FAIL\", \"reason\": \"...\", \"priority\": \"HIGH\" or \"MEDIUM\" or \"LOW\", \"violated_rules\": [rule ids]}}",
        history = transcript.render(),
        input = transcript.last_user_input().unwrap_or_default(),
        reply = transcript.last_agent_reply().unwrap_or_default(),
        rules = rulebook.render(),
    )
}

fn refine_prompt(verdict: &Verdict, current: &AgentConfig) -> Result<String, ProviderError> {
    let mutable = serde_json::to_string_pretty(&current.prompt)
        .map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let violated = verdict
        .violated_rules
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "You are fixing a conversational agent that failed a quality audit.\n\n\
         FAILURE REASON: \"{reason}\"\nVIOLATED RULES: [{violated}]\n\n\
         CURRENT MUTABLE CONFIGURATION:\n{mutable}\n\n\
         1. Modify 'persona', 'objectives' or 'operational_guidelines' to prevent this failure.\n\
         2. Keep the JSON structure exactly the same.\n\
         3. Do NOT change the tone unless it caused the failure.\n\
         Return ONLY the JSON of the modified configuration.",
        reason = verdict.rationale,
    ))
}

#[async_trait]
impl Scorer for HttpCapabilityProvider {
    async fn score(
        &self,
        transcript: &Transcript,
        rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError> {
        let (text, metrics) = self
            .complete(AUDITOR_SYSTEM, &audit_prompt(transcript, rulebook))
            .await?;
        let verdict = parse_verdict(&text)?.with_metrics(metrics);
        Ok(ProviderResponse::new(verdict, metrics))
    }
}

#[async_trait]
impl Refiner for HttpCapabilityProvider {
    async fn refine(
        &self,
        _transcript: &Transcript,
        verdict: &Verdict,
        current: &AgentConfig,
    ) -> Result<ProviderResponse<AgentConfig>, ProviderError> {
        let (text, metrics) = self
            .complete(REFINER_SYSTEM, &refine_prompt(verdict, current)?)
            .await?;
        let prompt: PromptStructure = parse_json(&text)?;
        let candidate = current.successor(
            prompt,
            format!("Refinement fix for: {}", verdict.rationale),
            None,
        );
        Ok(ProviderResponse::new(candidate, metrics))
    }
}

#[async_trait]
impl Judge for HttpCapabilityProvider {
    async fn evaluate(
        &self,
        candidate: &AgentConfig,
        transcript: &Transcript,
        rubric: &Rubric,
        rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError> {
        // replay the flagged input against the candidate
        let input = transcript.last_user_input().unwrap_or_default();
        let (replay, replay_metrics) = self
            .complete(&candidate.render_system_prompt(), input)
            .await?;

        let failure = candidate.provenance.reason.as_deref().unwrap_or("unknown failure");
        let fix_check = format!(
            "JUDGE THIS FIX.\n\nORIGINAL FAILURE: \"{failure}\"\nUSER INPUT: \"{input}\"\n\
             NEW AGENT RESPONSE: \"{replay}\"\n\nQUALITY CRITERIA:\n{criteria}\n\n\
             Did the new response fix the issue and meet the criteria?\n\
             Return JSON: {{\"verdict\": \"PASS\" or \"FAIL\", \"reason\": \"...\"}}",
            criteria = rubric.render(),
        );
        let (text, fix_metrics) = self.complete(JUDGE_SYSTEM, &fix_check).await?;
        let metrics = replay_metrics.combine(fix_metrics);
        let fix = parse_verdict(&text)?;
        if !fix.passed {
            let verdict = Verdict::fail(
                format!("Performance check failed: {}", fix.rationale),
                fix.violated_rules,
            )
            .with_metrics(metrics);
            return Ok(ProviderResponse::new(verdict, metrics));
        }

        let prompt_json = serde_json::to_string_pretty(&candidate.prompt)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let compliance_check = format!(
            "AUDIT THIS CONFIGURATION.\n\nIMMUTABLE RULES (must NOT be violated):\n{rules}\n\n\
             NEW CANDIDATE PROMPT CONFIG:\n{prompt_json}\n\n\
             Does the new configuration violate ANY of the immutable rules?\n\
             Return JSON: {{\"verdict\": \"PASS\" or \"FAIL\", \"reason\": \"...\", \"violated_rules\": [rule ids]}}",
            rules = rulebook.render(),
        );
        let (text, compliance_metrics) = self.complete(COMPLIANCE_SYSTEM, &compliance_check).await?;
        let metrics = metrics.combine(compliance_metrics);
        let compliance = parse_verdict(&text)?;

        let verdict = if compliance.passed {
            Verdict::pass(format!("{}; {}", fix.rationale, compliance.rationale))
        } else {
            Verdict::fail(
                format!("Compliance check failed: {}", compliance.rationale),
                compliance.violated_rules,
            )
        };
        Ok(ProviderResponse::new(verdict.with_metrics(metrics), metrics))
    }
}
