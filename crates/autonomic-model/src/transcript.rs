//! Conversation transcripts

use crate::ids::{AgentId, TranscriptRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("USER"),
            Self::Agent => f.write_str("AGENT"),
            Self::System => f.write_str("SYSTEM"),
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    #[inline]
    #[must_use]
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered, immutable record of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub reference: TranscriptRef,
    pub agent_id: AgentId,
    pub turns: Vec<Turn>,
}

impl Transcript {
    #[inline]
    #[must_use]
    pub fn new(reference: TranscriptRef, agent_id: AgentId, turns: Vec<Turn>) -> Self {
        Self {
            reference,
            agent_id,
            turns,
        }
    }

    /// Most recent user message, the input a candidate is replayed against
    #[must_use]
    pub fn last_user_input(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }

    /// Most recent agent reply, the output under audit
    #[must_use]
    pub fn last_agent_reply(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Agent)
            .map(|t| t.text.as_str())
    }

    /// Chronological listing, one line per turn
    #[must_use]
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .enumerate()
            .map(|(i, t)| format!("Turn {} [{}]: {}", i + 1, t.role, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Transcript {
        Transcript::new(
            TranscriptRef::from("chat-42"),
            AgentId::from("carsalesman"),
            vec![
                Turn::new(Role::User, "Do you have a 2024 Model X?"),
                Turn::new(Role::Agent, "Yes, in red, 20% off today!"),
                Turn::new(Role::User, "Great, how do I buy it?"),
            ],
        )
    }

    #[test]
    fn finds_last_turns_by_role() {
        let t = transcript();
        assert_eq!(t.last_user_input(), Some("Great, how do I buy it?"));
        assert_eq!(t.last_agent_reply(), Some("Yes, in red, 20% off today!"));
    }

    #[test]
    fn renders_numbered_turns() {
        let rendered = transcript().render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Turn 1 [USER]: Do you have a 2024 Model X?");
        assert!(lines[1].starts_with("Turn 2 [AGENT]"));
    }
}
