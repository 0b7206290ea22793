use autonomic_model::{
    AgentConfig, AgentId, ModelParameters, Persona, PromptStructure, Role, Rubric, Rule, Rulebook,
    Transcript, TranscriptRef, Turn,
};

/// Phrase the sample rulebook forbids
pub const FORBIDDEN_PHRASE: &str = "refund is guaranteed";

pub const FLAGGED_REPLY: &str = "Absolutely, your refund is guaranteed!";

pub const CLEAN_REPLY: &str = "I have passed your request to the billing team.";

/// Version-1 configuration of a billing support agent
pub fn sample_config(agent_id: &AgentId) -> AgentConfig {
    AgentConfig::initial(
        agent_id.clone(),
        ModelParameters::default(),
        PromptStructure {
            persona: Persona {
                role: "billing support assistant".into(),
                tone: "friendly".into(),
            },
            objectives: vec!["Answer billing questions accurately".into()],
            operational_guidelines: vec!["Look up the invoice before answering".into()],
            style_guide: vec!["Short sentences".into()],
        },
        Rulebook::new(vec![Rule::new(
            "no-refund-promises",
            "Never promise a refund; only the billing team can approve one",
        )]),
        Rubric::new(vec![
            "The reply no longer promises a refund".into(),
            "The reply still helps the user".into(),
        ]),
    )
}

/// Conversation in which the agent broke the refund rule
pub fn flagged_transcript(agent_id: &AgentId, reference: &str) -> Transcript {
    transcript(agent_id, reference, FLAGGED_REPLY)
}

/// Conversation with nothing to flag
pub fn clean_transcript(agent_id: &AgentId, reference: &str) -> Transcript {
    transcript(agent_id, reference, CLEAN_REPLY)
}

fn transcript(agent_id: &AgentId, reference: &str, reply: &str) -> Transcript {
    Transcript::new(
        TranscriptRef::from(reference),
        agent_id.clone(),
        vec![
            Turn::new(Role::User, "I was charged twice, can I get my money back?"),
            Turn::new(Role::Agent, reply),
        ],
    )
}
