//! Structural validation of refined candidates
//!
//! A refinement may only rewrite the prompt. Anything else that changed, or a
//! prompt that would leave the agent without instructions, makes the candidate
//! one that could never pass evaluation.

use crate::agent::AgentConfig;
use crate::hash::HashError;
use crate::ids::AgentId;

/// Why a candidate configuration is not well-formed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("candidate belongs to agent {actual}, expected {expected}")]
    AgentMismatch { expected: AgentId, actual: AgentId },

    #[error("empty prompt: persona role, objectives and guidelines are all blank")]
    EmptyPrompt,

    #[error("persona role is empty")]
    MissingPersona,

    #[error("candidate has no objectives or operational guidelines")]
    NoInstructions,

    #[error("audit rulebook was modified")]
    RulebookChanged,

    #[error("evaluation rubric was modified")]
    RubricChanged,

    #[error("model parameter out of range: {0}")]
    ModelParameters(String),

    #[error("candidate is identical to the current configuration")]
    Unchanged,

    #[error("could not fingerprint candidate: {0}")]
    Fingerprint(String),
}

impl From<HashError> for ValidationError {
    fn from(err: HashError) -> Self {
        Self::Fingerprint(err.to_string())
    }
}

/// Checks a candidate against the configuration it was refined from
#[derive(Debug, Clone, Copy)]
pub struct StructuralValidator {
    max_temperature: f32,
}

impl StructuralValidator {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_temperature: 2.0,
        }
    }

    /// Validate `candidate` as a refinement of `current`
    ///
    /// # Errors
    /// Returns the first structural problem found
    pub fn validate(
        &self,
        current: &AgentConfig,
        candidate: &AgentConfig,
    ) -> Result<(), ValidationError> {
        if candidate.agent_id != current.agent_id {
            return Err(ValidationError::AgentMismatch {
                expected: current.agent_id.clone(),
                actual: candidate.agent_id.clone(),
            });
        }

        let prompt = &candidate.prompt;
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if prompt.persona.role.trim().is_empty() {
            return Err(ValidationError::MissingPersona);
        }
        let has_instruction = prompt
            .objectives
            .iter()
            .chain(&prompt.operational_guidelines)
            .any(|line| !line.trim().is_empty());
        if !has_instruction {
            return Err(ValidationError::NoInstructions);
        }

        if candidate.rulebook != current.rulebook {
            return Err(ValidationError::RulebookChanged);
        }
        if candidate.rubric != current.rubric {
            return Err(ValidationError::RubricChanged);
        }

        let model = &candidate.model;
        if !(0.0..=self.max_temperature).contains(&model.temperature) {
            return Err(ValidationError::ModelParameters(format!(
                "temperature {} not in 0.0..={}",
                model.temperature, self.max_temperature
            )));
        }
        if model.max_output_tokens == 0 {
            return Err(ValidationError::ModelParameters(
                "max_output_tokens is 0".to_string(),
            ));
        }
        if model.model_name.trim().is_empty() {
            return Err(ValidationError::ModelParameters(
                "model_name is empty".to_string(),
            ));
        }

        if candidate.fingerprint()? == current.fingerprint()? {
            return Err(ValidationError::Unchanged);
        }

        Ok(())
    }
}

impl Default for StructuralValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ModelParameters, Persona, PromptStructure, Rubric, Rule, Rulebook};

    fn current() -> AgentConfig {
        AgentConfig::initial(
            AgentId::from("carsalesman"),
            ModelParameters::default(),
            PromptStructure {
                persona: Persona {
                    role: "car sales assistant".into(),
                    tone: "friendly".into(),
                },
                objectives: vec!["Sell cars".into()],
                operational_guidelines: vec![],
                style_guide: vec![],
            },
            Rulebook::new(vec![Rule::new("R1", "Never offer discounts")]),
            Rubric::new(vec!["Captures contact details".into()]),
        )
    }

    fn refined() -> AgentConfig {
        let base = current();
        let mut prompt = base.prompt.clone();
        prompt
            .operational_guidelines
            .push("Never mention price reductions".into());
        base.successor(prompt, "discount offered", None)
    }

    #[test]
    fn accepts_prompt_only_change() {
        assert_eq!(StructuralValidator::new().validate(&current(), &refined()), Ok(()));
    }

    #[test]
    fn rejects_empty_prompt() {
        let mut candidate = refined();
        candidate.prompt = PromptStructure::default();
        assert_eq!(
            StructuralValidator::new().validate(&current(), &candidate),
            Err(ValidationError::EmptyPrompt)
        );
    }

    #[test]
    fn rejects_blank_instructions() {
        let mut candidate = refined();
        candidate.prompt.objectives = vec!["   ".into()];
        candidate.prompt.operational_guidelines.clear();
        assert_eq!(
            StructuralValidator::new().validate(&current(), &candidate),
            Err(ValidationError::NoInstructions)
        );
    }

    #[test]
    fn rejects_rulebook_edits() {
        let mut candidate = refined();
        candidate.rulebook.rules.clear();
        assert_eq!(
            StructuralValidator::new().validate(&current(), &candidate),
            Err(ValidationError::RulebookChanged)
        );
    }

    #[test]
    fn rejects_other_agent() {
        let mut candidate = refined();
        candidate.agent_id = AgentId::from("someone-else");
        assert!(matches!(
            StructuralValidator::new().validate(&current(), &candidate),
            Err(ValidationError::AgentMismatch { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut candidate = refined();
        candidate.model.temperature = 3.5;
        assert!(matches!(
            StructuralValidator::new().validate(&current(), &candidate),
            Err(ValidationError::ModelParameters(_))
        ));
    }

    #[test]
    fn rejects_unchanged_candidate() {
        let base = current();
        let candidate = base.successor(base.prompt.clone(), "no-op", None);
        assert_eq!(
            StructuralValidator::new().validate(&base, &candidate),
            Err(ValidationError::Unchanged)
        );
    }
}
