//! Turns and the append-only conversation a run accumulates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnSource {
    User,
    Responder,
    System,
}

/// A single entry in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub source: TurnSource,
    /// Responder that produced the turn, for responder turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            source: TurnSource::User,
            speaker: None,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn responder(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: TurnSource::Responder,
            speaker: Some(speaker.into()),
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            source: TurnSource::System,
            speaker: None,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    /// System turn recording a transfer so the next responder knows why it
    /// was invoked.
    pub fn transfer(from: &str, to: &str, note: Option<&str>) -> Self {
        let text = match note {
            Some(note) if !note.trim().is_empty() => {
                format!("{from} transferred the conversation to {to}. Note: {note}")
            }
            _ => format!("{from} transferred the conversation to {to}."),
        };
        Self::system(text)
    }
}

/// Ordered turns of one run.
///
/// Turns are only ever appended, and only by the dispatch loop that owns the
/// run; there is no API to remove or reorder them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Start a conversation with the caller's request.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::user(input)],
        }
    }

    pub(crate) fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// The original request text.
    pub fn input(&self) -> Option<&str> {
        self.turns
            .iter()
            .find(|t| t.source == TurnSource::User)
            .map(|t| t.text.as_str())
    }
}
