//! Agent configuration snapshots
//!
//! An [`AgentConfig`] is the "agent as data" record: the version store keeps
//! an ordered history of them per agent, and the loop only ever reads the
//! latest one or appends a successor. Nothing here mutates a stored snapshot.

use crate::hash::{ContentHash, HashError};
use crate::ids::{AgentId, EpisodeId, RuleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rule applied when an agent's rulebook is empty
pub const DEFAULT_AUDIT_RULE: &str = "Check for helpfulness and accuracy.";

/// Immutable, versioned agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Owning agent
    pub agent_id: AgentId,
    /// Monotonically increasing version (first version is 1)
    pub version: u64,
    /// Model parameters
    pub model: ModelParameters,
    /// Prompt structure (the only part a refinement may change)
    pub prompt: PromptStructure,
    /// Audit rulebook
    pub rulebook: Rulebook,
    /// Evaluation rubric
    pub rubric: Rubric,
    /// Where this snapshot came from
    #[serde(default)]
    pub provenance: Provenance,
}

/// Behaviour-defining fields, hashed for [`AgentConfig::fingerprint`]
#[derive(Serialize)]
struct FingerprintView<'a> {
    model: &'a ModelParameters,
    prompt: &'a PromptStructure,
    rulebook: &'a Rulebook,
    rubric: &'a Rubric,
}

impl AgentConfig {
    /// Create the first version of an agent's configuration
    #[must_use]
    pub fn initial(
        agent_id: AgentId,
        model: ModelParameters,
        prompt: PromptStructure,
        rulebook: Rulebook,
        rubric: Rubric,
    ) -> Self {
        Self {
            agent_id,
            version: 1,
            model,
            prompt,
            rulebook,
            rubric,
            provenance: Provenance::seeded(),
        }
    }

    /// Fingerprint of model, prompt, rulebook and rubric
    ///
    /// Version and provenance are excluded so that a rebased candidate keeps
    /// the fingerprint of the content it was judged on.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn fingerprint(&self) -> Result<ContentHash, HashError> {
        ContentHash::of(&FingerprintView {
            model: &self.model,
            prompt: &self.prompt,
            rulebook: &self.rulebook,
            rubric: &self.rubric,
        })
    }

    /// Successor snapshot with a new prompt, version `self.version + 1`
    #[must_use]
    pub fn successor(
        &self,
        prompt: PromptStructure,
        reason: impl Into<String>,
        episode: Option<EpisodeId>,
    ) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            version: self.version + 1,
            model: self.model.clone(),
            prompt,
            rulebook: self.rulebook.clone(),
            rubric: self.rubric.clone(),
            provenance: Provenance {
                created_at: Utc::now(),
                reason: Some(reason.into()),
                source_episode: episode,
            },
        }
    }

    /// Same content placed on top of `previous_version`
    #[must_use]
    pub fn rebased_on(&self, previous_version: u64) -> Self {
        let mut next = self.clone();
        next.version = previous_version + 1;
        next
    }

    /// Whether this snapshot was committed by the given episode
    #[inline]
    #[must_use]
    pub fn committed_by(&self, episode: EpisodeId) -> bool {
        self.provenance.source_episode == Some(episode)
    }

    /// System prompt used when replaying a conversation against this config
    #[must_use]
    pub fn render_system_prompt(&self) -> String {
        let persona = &self.prompt.persona;
        let mut out = format!("You are a {}.\n", persona.role);
        if !self.prompt.objectives.is_empty() {
            out.push_str("OBJECTIVES:\n");
            for objective in &self.prompt.objectives {
                out.push_str(&format!("- {objective}\n"));
            }
        }
        if !self.prompt.operational_guidelines.is_empty() {
            out.push_str("GUIDELINES:\n");
            for guideline in &self.prompt.operational_guidelines {
                out.push_str(&format!("- {guideline}\n"));
            }
        }
        if !self.prompt.style_guide.is_empty() {
            out.push_str(&format!("STYLE: {}\n", self.prompt.style_guide.join("; ")));
        }
        out.push_str(&format!("TONE: {}\n", persona.tone));
        out
    }
}

/// Model invocation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub model_name: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            model_name: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            max_output_tokens: 2000,
        }
    }
}

/// Persona of the agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Persona {
    pub role: String,
    #[serde(default)]
    pub tone: String,
}

/// Mutable prompt fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptStructure {
    pub persona: Persona,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub operational_guidelines: Vec<String>,
    #[serde(default)]
    pub style_guide: Vec<String>,
}

impl PromptStructure {
    /// No persona role and no instructions at all
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.persona.role.trim().is_empty()
            && self.objectives.is_empty()
            && self.operational_guidelines.is_empty()
    }
}

/// One audit rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub text: String,
}

impl Rule {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: RuleId::new(id),
            text: text.into(),
        }
    }
}

/// Audit rulebook
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rulebook {
    pub rules: Vec<Rule>,
}

impl Rulebook {
    #[inline]
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Rules to audit against; falls back to [`DEFAULT_AUDIT_RULE`] when empty
    #[must_use]
    pub fn effective_rules(&self) -> Vec<Rule> {
        if self.rules.is_empty() {
            vec![Rule::new("default", DEFAULT_AUDIT_RULE)]
        } else {
            self.rules.clone()
        }
    }

    /// Numbered listing for prompts
    #[must_use]
    pub fn render(&self) -> String {
        self.effective_rules()
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("{}. [{}] {}", i + 1, rule.id, rule.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Evaluation rubric
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: Vec<String>,
}

impl Rubric {
    #[inline]
    #[must_use]
    pub fn new(criteria: Vec<String>) -> Self {
        Self { criteria }
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Origin of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub created_at: DateTime<Utc>,
    /// Why this version exists (e.g. the failure it fixes)
    pub reason: Option<String>,
    /// Remediation episode that produced it, if any
    pub source_episode: Option<EpisodeId>,
}

impl Provenance {
    #[inline]
    #[must_use]
    pub fn seeded() -> Self {
        Self {
            created_at: Utc::now(),
            reason: None,
            source_episode: None,
        }
    }
}

impl Default for Provenance {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig::initial(
            AgentId::from("carsalesman"),
            ModelParameters::default(),
            PromptStructure {
                persona: Persona {
                    role: "car sales assistant".into(),
                    tone: "friendly".into(),
                },
                objectives: vec!["Help customers find a vehicle".into()],
                operational_guidelines: vec!["Only quote listed inventory".into()],
                style_guide: vec![],
            },
            Rulebook::new(vec![Rule::new("R1", "Never offer discounts")]),
            Rubric::new(vec!["Agent provided correct information.".into()]),
        )
    }

    #[test]
    fn fingerprint_ignores_version_and_provenance() {
        let v1 = sample();
        let v2 = v1.successor(v1.prompt.clone(), "noop", Some(EpisodeId::new()));
        assert_eq!(v2.version, 2);
        assert_eq!(v1.fingerprint().unwrap(), v2.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_tracks_prompt_changes() {
        let v1 = sample();
        let mut prompt = v1.prompt.clone();
        prompt.operational_guidelines.push("Ask for an email address".into());
        let v2 = v1.successor(prompt, "missed lead", None);
        assert_ne!(v1.fingerprint().unwrap(), v2.fingerprint().unwrap());
        assert_eq!(v2.rulebook, v1.rulebook);
    }

    #[test]
    fn rebase_keeps_content() {
        let episode = EpisodeId::new();
        let candidate = sample().successor(sample().prompt, "fix", Some(episode));
        let rebased = candidate.rebased_on(7);
        assert_eq!(rebased.version, 8);
        assert!(rebased.committed_by(episode));
        assert_eq!(rebased.fingerprint().unwrap(), candidate.fingerprint().unwrap());
    }

    #[test]
    fn empty_rulebook_falls_back_to_default_rule() {
        let rules = Rulebook::default().effective_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].text, DEFAULT_AUDIT_RULE);
        assert!(sample().rulebook.render().starts_with("1. [R1]"));
    }

    #[test]
    fn system_prompt_mentions_persona_and_guidelines() {
        let prompt = sample().render_system_prompt();
        assert!(prompt.starts_with("You are a car sales assistant."));
        assert!(prompt.contains("- Only quote listed inventory"));
        assert!(prompt.contains("TONE: friendly"));
    }
}
