//! Conversation history and prompt rendering

use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::{CoreError, Result};

/// One user message and the assistant reply, if any yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    /// `None` while the reply is pending
    pub assistant: Option<String>,
}

impl Turn {
    pub fn pending(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: None,
        }
    }

    pub fn completed(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: Some(assistant.into()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.assistant.is_none()
    }
}

/// The most recent `history_length` turns, the pending one included
pub fn window(history: &[Turn], history_length: usize) -> &[Turn] {
    let start = history.len().saturating_sub(history_length);
    &history[start..]
}

/// Check that `history` ends with the turn awaiting a reply
pub fn validate_history(history: &[Turn]) -> Result<()> {
    match history.last() {
        None => Err(CoreError::invalid_input(
            "CHAT_EMPTY_HISTORY",
            "no user turn to answer",
            "Validating conversation history",
            "Append the user's message as a pending turn",
        )),
        Some(turn) if !turn.is_pending() => Err(CoreError::invalid_input(
            "CHAT_NO_PENDING_TURN",
            "the last turn already has a reply",
            "Validating conversation history",
            "Append the user's message as a pending turn",
        )),
        Some(_) => Ok(()),
    }
}

/// Renders turns into the single text payload sent to the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub preamble: String,
    pub user_tag: String,
    pub assistant_tag: String,
}

impl PromptTemplate {
    pub fn from_config(chat: &ChatConfig) -> Result<Self> {
        Ok(Self {
            preamble: chat.resolve_preamble()?,
            user_tag: chat.user_tag.clone(),
            assistant_tag: chat.assistant_tag.clone(),
        })
    }

    /// `{preamble}\n\n{turns}\n\n{assistant_tag}\n`, with role tags between
    /// turns and the first user message left untagged.
    pub fn render(&self, turns: &[Turn]) -> String {
        let mut body = String::new();
        for (i, turn) in turns.iter().enumerate() {
            if i > 0 {
                body.push_str("\n\n");
                body.push_str(&self.user_tag);
                body.push('\n');
            }
            body.push_str(&turn.user);
            if let Some(reply) = &turn.assistant {
                body.push_str("\n\n");
                body.push_str(&self.assistant_tag);
                body.push('\n');
                body.push_str(reply);
            }
        }
        format!("{}\n\n{}\n\n{}\n", self.preamble, body, self.assistant_tag)
    }
}

/// An in-memory conversation bounded to the most recent turns
#[derive(Debug, Clone)]
pub struct ChatSession {
    template: PromptTemplate,
    history_length: usize,
    turns: Vec<Turn>,
}

impl ChatSession {
    pub fn new(template: PromptTemplate, history_length: usize) -> Self {
        Self {
            template,
            history_length,
            turns: Vec::new(),
        }
    }

    pub fn from_config(chat: &ChatConfig) -> Result<Self> {
        Ok(Self::new(PromptTemplate::from_config(chat)?, chat.history_length))
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn history_length(&self) -> usize {
        self.history_length
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Start a new turn, dropping history beyond the window
    pub fn push_user(&mut self, message: impl Into<String>) {
        self.turns.push(Turn::pending(message));
        let excess = self.turns.len().saturating_sub(self.history_length);
        self.turns.drain(..excess);
    }

    /// Payload for the pending turn
    pub fn render(&self) -> String {
        self.template.render(window(&self.turns, self.history_length))
    }

    /// Replace the pending reply with the latest partial output
    pub fn apply_partial(&mut self, text: &str) {
        if let Some(turn) = self.turns.last_mut() {
            turn.assistant = Some(text.to_string());
        }
    }

    /// Adopt the final transcript of a finished turn
    pub fn commit(&mut self, transcript: Vec<Turn>) {
        self.turns = transcript;
        let excess = self.turns.len().saturating_sub(self.history_length);
        self.turns.drain(..excess);
    }

    /// Drop the pending turn of a request that never started
    pub fn abandon_pending(&mut self) -> Option<Turn> {
        match self.turns.last() {
            Some(turn) if turn.is_pending() => self.turns.pop(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PromptTemplate {
        PromptTemplate {
            preamble: "PRE".to_string(),
            user_tag: "### User".to_string(),
            assistant_tag: "### Dromedary".to_string(),
        }
    }

    #[test]
    fn test_render_first_turn() {
        let rendered = template().render(&[Turn::pending("Tell me about llama.")]);
        assert_eq!(rendered, "PRE\n\nTell me about llama.\n\n### Dromedary\n");
    }

    #[test]
    fn test_render_interleaves_role_tags() {
        let turns = vec![
            Turn::completed("Hi", "Hello!"),
            Turn::pending("Tell me about alpaca."),
        ];
        assert_eq!(
            template().render(&turns),
            "PRE\n\nHi\n\n### Dromedary\nHello!\n\n### User\nTell me about alpaca.\n\n### Dromedary\n"
        );
    }

    #[test]
    fn test_session_window_and_partial_updates() {
        let mut session = ChatSession::new(template(), 2);
        session.push_user("one");
        session.apply_partial("1");
        session.push_user("two");
        session.apply_partial("2");
        session.push_user("three");

        let users: Vec<&str> = session.turns().iter().map(|t| t.user.as_str()).collect();
        assert_eq!(users, vec!["two", "three"]);
        assert!(session.turns()[1].is_pending());
        assert!(session.render().starts_with("PRE\n\ntwo\n\n### Dromedary\n2"));

        session.apply_partial("thr");
        session.apply_partial("three!");
        assert_eq!(session.turns()[1].assistant.as_deref(), Some("three!"));

        session.clear();
        assert!(session.turns().is_empty());
    }

    #[test]
    fn test_abandon_pending_only_drops_unanswered_turn() {
        let mut session = ChatSession::new(template(), 4);
        session.push_user("a");
        session.apply_partial("reply");
        assert!(session.abandon_pending().is_none());

        session.push_user("b");
        assert_eq!(session.abandon_pending(), Some(Turn::pending("b")));
        assert_eq!(session.turns().len(), 1);
    }

    #[test]
    fn test_validate_history() {
        assert_eq!(validate_history(&[]).unwrap_err().code(), "CHAT_EMPTY_HISTORY");
        assert_eq!(
            validate_history(&[Turn::completed("a", "b")]).unwrap_err().code(),
            "CHAT_NO_PENDING_TURN"
        );
        assert!(validate_history(&[Turn::completed("a", "b"), Turn::pending("c")]).is_ok());
    }
}
