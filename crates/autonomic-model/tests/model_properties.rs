use autonomic_model::{
    AgentConfig, AgentId, EpisodeId, ModelParameters, Persona, PromptStructure, Role, Rubric,
    Rule, Rulebook, StructuralValidator, Transcript, TranscriptRef, Turn, ValidationError,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn config(guidelines: Vec<String>) -> AgentConfig {
    AgentConfig::initial(
        AgentId::from("x"),
        ModelParameters::default(),
        PromptStructure {
            persona: Persona {
                role: "support assistant".into(),
                tone: "calm".into(),
            },
            objectives: vec!["Help the user".into()],
            operational_guidelines: guidelines,
            style_guide: vec![],
        },
        Rulebook::new(vec![Rule::new("R1", "Never share account numbers")]),
        Rubric::new(vec!["The reply is safe".into()]),
    )
}

proptest! {
    #[test]
    fn prop_rebase_keeps_fingerprint_and_numbers_successor(
        guideline in "[a-z ]{1,40}",
        base in 1u64..1000,
    ) {
        let current = config(vec![]);
        let mut prompt = current.prompt.clone();
        prompt.operational_guidelines.push(guideline);
        let candidate = current.successor(prompt, "fix", Some(EpisodeId::new()));
        let rebased = candidate.rebased_on(base);

        prop_assert_eq!(rebased.version, base + 1);
        prop_assert_eq!(rebased.fingerprint().unwrap(), candidate.fingerprint().unwrap());
        prop_assert_eq!(&rebased.provenance, &candidate.provenance);
    }

    #[test]
    fn prop_added_guideline_is_valid_refinement(guideline in "[a-zA-Z]{1,20}( [a-zA-Z]{1,20}){0,5}") {
        let current = config(vec!["Verify identity first".into()]);
        let mut prompt = current.prompt.clone();
        prompt.operational_guidelines.push(guideline);
        let candidate = current.successor(prompt, "fix", None);
        prop_assert_eq!(StructuralValidator::new().validate(&current, &candidate), Ok(()));
    }

    #[test]
    fn prop_rulebook_edits_are_rejected(text in "[a-z]{1,30}") {
        let current = config(vec![]);
        let mut candidate = current.successor(current.prompt.clone(), "fix", None);
        candidate.prompt.objectives.push("Also be brief".into());
        candidate.rulebook.rules.push(Rule::new("R2", text));
        prop_assert_eq!(
            StructuralValidator::new().validate(&current, &candidate),
            Err(ValidationError::RulebookChanged)
        );
    }

    #[test]
    fn prop_render_has_one_line_per_turn(texts in proptest::collection::vec("[a-z]{1,12}", 0..8)) {
        let turns: Vec<Turn> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Turn::new(if i % 2 == 0 { Role::User } else { Role::Agent }, t.as_str()))
            .collect();
        let transcript = Transcript::new(TranscriptRef::from("chat"), AgentId::from("x"), turns);
        prop_assert_eq!(transcript.render().lines().count(), texts.len());
    }
}

#[test]
fn test_agent_config_json_round_trip() {
    let current = config(vec!["Verify identity first".into()]);
    let json = serde_json::to_string(&current).unwrap();
    let back: AgentConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, current);
}
