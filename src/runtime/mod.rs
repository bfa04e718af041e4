//! Agent runtime client port.
//!
//! The core never talks to the agent runtime directly; it goes through
//! the [`RuntimeClient`] trait so the supervisor and workflow engine can
//! be driven by a mock in tests. Request and response shapes mirror the
//! runtime's wire format: sessions are created with an optional parent,
//! prompted with text parts, and polled for status and messages.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;

/// Runtime RPC errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime reported an error for the call.
    #[error("runtime client error: {0}")]
    Rpc(String),
    /// The referenced session is unknown to the runtime.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Request to create a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Parent session for lineage, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Human-readable session title.
    pub title: String,
}

/// Where a session currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// The session is idle and can accept a prompt.
    Idle,
    /// The session is working.
    Busy,
    /// Any state this build does not know.
    #[serde(untagged)]
    Other(String),
}

/// One part of a session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// A tool call or other non-text part, carried opaquely.
    #[serde(other)]
    Other,
}

/// Author role of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Human or parent-agent input.
    User,
    /// The agent's output.
    Assistant,
}

/// One message in a session's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// Who authored the message.
    pub role: MessageRole,
    /// Creation time (unix ms).
    pub created: i64,
    /// Message parts.
    pub parts: Vec<MessagePart>,
}

impl SessionMessage {
    /// All text parts joined.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Other => None,
            })
            .collect()
    }
}

/// The runtime client port.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to
/// call concurrently; every method is an RPC with its own timeout on the
/// implementor's side.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create a session; returns its id.
    async fn create_session(&self, request: CreateSessionRequest) -> Result<String, RuntimeError>;

    /// Send a text prompt to `agent` inside a session.
    async fn prompt(&self, session_id: &str, agent: &str, text: &str)
        -> Result<(), RuntimeError>;

    /// Current state of every known session.
    async fn status(&self) -> Result<HashMap<String, SessionState>, RuntimeError>;

    /// Full message history of a session, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, RuntimeError>;
}

/// The most recent assistant message's text, if any.
///
/// This is the supervisor's result-fetch rule: newest assistant message
/// wins, text parts concatenated, non-text parts ignored.
pub fn latest_assistant_text(messages: &[SessionMessage]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .max_by_key(|m| m.created)
        .map(SessionMessage::text)
}
