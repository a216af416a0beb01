mod openai;

pub use openai::{ChatModelConfig, OpenAiCompatibleChat};

use crate::models::{ConversationTurn, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        match turn.role {
            Role::User => Self::user(turn.text.clone()),
            Role::Assistant => Self::assistant(turn.text.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

/// System message, then the history in order, then the new question.
pub fn conversation_messages(
    system: String,
    history: &[ConversationTurn],
    question: &str,
) -> Vec<ChatMessage> {
    std::iter::once(ChatMessage::system(system))
        .chain(history.iter().map(ChatMessage::from))
        .chain(std::iter::once(ChatMessage::user(question)))
        .collect()
}

/// Trims a model reply and drops one pair of wrapping quotes.
pub(crate) fn clean_reply(reply: &str) -> String {
    let trimmed = reply.trim();
    let unquoted = [('"', '"'), ('“', '”'), ('\'', '\''), ('«', '»')]
        .iter()
        .find_map(|(open, close)| {
            trimmed
                .strip_prefix(*open)
                .and_then(|rest| rest.strip_suffix(*close))
        })
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}
