use async_trait::async_trait;
use autonomic_core::{Judge, ProviderError, ProviderResponse, Refiner, Scorer};
use autonomic_model::{
    AgentConfig, ProviderMetrics, PromptStructure, Rubric, Rulebook, Transcript, Verdict,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::fixtures::FORBIDDEN_PHRASE;

/// Scripted answer of the refiner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineScript {
    /// Add a guideline addressing the failing verdict
    Fix,
    /// Return a candidate whose prompt is blank
    EmptyPrompt,
}

/// Scripted answer of the judge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeScript {
    Pass,
    Fail(String),
}

/// Deterministic stand-in for all three capability providers
///
/// The scorer fails any transcript whose last agent reply contains a
/// forbidden phrase. Refiner and judge answers are taken from queues, falling
/// back to [`RefineScript::Fix`] and [`JudgeScript::Pass`] once drained.
#[derive(Debug)]
pub struct ScriptedProvider {
    forbidden: Vec<String>,
    refine_script: Mutex<VecDeque<RefineScript>>,
    judge_script: Mutex<VecDeque<JudgeScript>>,
    judge_outages: AtomicU32,
    latency: Duration,
    score_calls: AtomicUsize,
    refine_calls: AtomicUsize,
    judge_calls: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            forbidden: vec![FORBIDDEN_PHRASE.to_string()],
            refine_script: Mutex::new(VecDeque::new()),
            judge_script: Mutex::new(VecDeque::new()),
            judge_outages: AtomicU32::new(0),
            latency: Duration::ZERO,
            score_calls: AtomicUsize::new(0),
            refine_calls: AtomicUsize::new(0),
            judge_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_refine_script(self, script: impl IntoIterator<Item = RefineScript>) -> Self {
        self.refine_script.lock().extend(script);
        self
    }

    #[must_use]
    pub fn with_judge_script(self, script: impl IntoIterator<Item = JudgeScript>) -> Self {
        self.judge_script.lock().extend(script);
        self
    }

    /// Fail the first `n` judge calls with a transport error
    #[must_use]
    pub fn with_judge_outages(self, n: u32) -> Self {
        self.judge_outages.store(n, Ordering::SeqCst);
        self
    }

    /// Delay every call, to widen race windows
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    pub fn refine_calls(&self) -> usize {
        self.refine_calls.load(Ordering::SeqCst)
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn metrics(&self) -> ProviderMetrics {
        let ms = u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX);
        ProviderMetrics::new(0.000_5, ms)
    }

    fn flagged_phrase(&self, reply: &str) -> Option<&str> {
        let reply = reply.to_lowercase();
        self.forbidden
            .iter()
            .find(|p| reply.contains(&p.to_lowercase()))
            .map(String::as_str)
    }
}

#[async_trait]
impl Scorer for ScriptedProvider {
    async fn score(
        &self,
        transcript: &Transcript,
        rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let reply = transcript.last_agent_reply().unwrap_or_default();
        let verdict = match self.flagged_phrase(reply) {
            Some(phrase) => Verdict::fail(
                format!("agent said \"{phrase}\""),
                rulebook
                    .effective_rules()
                    .into_iter()
                    .take(1)
                    .map(|r| r.id)
                    .collect(),
            ),
            None => Verdict::pass("no rule violated"),
        };
        Ok(ProviderResponse::new(verdict, self.metrics()))
    }
}

#[async_trait]
impl Refiner for ScriptedProvider {
    async fn refine(
        &self,
        _transcript: &Transcript,
        verdict: &Verdict,
        current: &AgentConfig,
    ) -> Result<ProviderResponse<AgentConfig>, ProviderError> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let script = self
            .refine_script
            .lock()
            .pop_front()
            .unwrap_or(RefineScript::Fix);
        let prompt = match script {
            RefineScript::Fix => {
                let mut prompt = current.prompt.clone();
                prompt
                    .operational_guidelines
                    .push(format!("Do not repeat this mistake: {}", verdict.rationale));
                prompt
            }
            RefineScript::EmptyPrompt => PromptStructure::default(),
        };
        let candidate = current.successor(prompt, format!("Refinement fix for: {}", verdict.rationale), None);
        Ok(ProviderResponse::new(candidate, self.metrics()))
    }
}

#[async_trait]
impl Judge for ScriptedProvider {
    async fn evaluate(
        &self,
        _candidate: &AgentConfig,
        _transcript: &Transcript,
        _rubric: &Rubric,
        _rulebook: &Rulebook,
    ) -> Result<ProviderResponse<Verdict>, ProviderError> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let outage = self
            .judge_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(ProviderError::Transport("judge backend unreachable".into()));
        }
        let script = self
            .judge_script
            .lock()
            .pop_front()
            .unwrap_or(JudgeScript::Pass);
        let verdict = match script {
            JudgeScript::Pass => Verdict::pass("candidate fixes the flagged reply"),
            JudgeScript::Fail(reason) => Verdict::fail(reason, Vec::new()),
        };
        Ok(ProviderResponse::new(verdict, self.metrics()))
    }
}
