//! In-memory runtime client for tests and dry runs.
//!
//! Sessions are plain map entries; tests script the runtime by toggling
//! idle flags, pushing assistant messages, and arming failure injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CreateSessionRequest, MessagePart, MessageRole, RuntimeClient, RuntimeError, SessionMessage,
    SessionState,
};

/// One recorded prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrompt {
    /// Session the prompt went to.
    pub session_id: String,
    /// Agent addressed.
    pub agent: String,
    /// Prompt text.
    pub text: String,
}

struct MockSession {
    parent_id: Option<String>,
    title: String,
    state: SessionState,
    messages: Vec<SessionMessage>,
}

impl MockSession {
    fn new(parent_id: Option<String>, title: String) -> Self {
        Self {
            parent_id,
            title,
            state: SessionState::Busy,
            messages: Vec::new(),
        }
    }
}

/// Scriptable in-memory runtime.
#[derive(Default)]
pub struct MockRuntimeClient {
    sessions: Mutex<HashMap<String, MockSession>>,
    prompts: Mutex<Vec<RecordedPrompt>>,
    counter: AtomicU64,
    fail_create: AtomicBool,
    fail_prompt: AtomicBool,
    fail_messages: AtomicBool,
}

impl MockRuntimeClient {
    /// Fresh mock with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_session` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }

    /// Make the next `prompt` calls fail.
    pub fn fail_prompt(&self, fail: bool) {
        self.fail_prompt.store(fail, Ordering::Relaxed);
    }

    /// Make the next `messages` calls fail.
    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::Relaxed);
    }

    /// Register a session that exists outside `create_session` (e.g. a
    /// parent session the test pretends was already running).
    pub fn seed_session(&self, session_id: &str) {
        self.lock_sessions().insert(
            session_id.to_owned(),
            MockSession::new(None, session_id.to_owned()),
        );
    }

    /// Toggle a session's idle state.
    pub fn set_idle(&self, session_id: &str, idle: bool) {
        if let Some(session) = self.lock_sessions().get_mut(session_id) {
            session.state = if idle {
                SessionState::Idle
            } else {
                SessionState::Busy
            };
        }
    }

    /// Append an assistant message to a session.
    pub fn push_assistant_message(&self, session_id: &str, created: i64, text: &str) {
        if let Some(session) = self.lock_sessions().get_mut(session_id) {
            session.messages.push(SessionMessage {
                role: MessageRole::Assistant,
                created,
                parts: vec![MessagePart::Text {
                    text: text.to_owned(),
                }],
            });
        }
    }

    /// Every prompt sent so far, in order.
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.lock_prompts().clone()
    }

    /// Ids of sessions created through the client, in creation order.
    pub fn created_sessions(&self) -> Vec<String> {
        let sessions = self.lock_sessions();
        let mut ids: Vec<String> = sessions
            .keys()
            .filter(|id| id.starts_with("mock_ses_"))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Parent recorded for a created session.
    pub fn parent_of(&self, session_id: &str) -> Option<String> {
        self.lock_sessions()
            .get(session_id)
            .and_then(|s| s.parent_id.clone())
    }

    /// Title recorded for a created session.
    pub fn title_of(&self, session_id: &str) -> Option<String> {
        self.lock_sessions()
            .get(session_id)
            .map(|s| s.title.clone())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_prompts(&self) -> std::sync::MutexGuard<'_, Vec<RecordedPrompt>> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RuntimeClient for MockRuntimeClient {
    async fn create_session(&self, request: CreateSessionRequest) -> Result<String, RuntimeError> {
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(RuntimeError::Rpc("injected create failure".to_owned()));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("mock_ses_{n}");
        self.lock_sessions()
            .insert(id.clone(), MockSession::new(request.parent_id, request.title));
        Ok(id)
    }

    async fn prompt(
        &self,
        session_id: &str,
        agent: &str,
        text: &str,
    ) -> Result<(), RuntimeError> {
        if self.fail_prompt.load(Ordering::Relaxed) {
            return Err(RuntimeError::Rpc("injected prompt failure".to_owned()));
        }
        if !self.lock_sessions().contains_key(session_id) {
            return Err(RuntimeError::UnknownSession(session_id.to_owned()));
        }
        self.lock_prompts().push(RecordedPrompt {
            session_id: session_id.to_owned(),
            agent: agent.to_owned(),
            text: text.to_owned(),
        });
        Ok(())
    }

    async fn status(&self) -> Result<HashMap<String, SessionState>, RuntimeError> {
        Ok(self
            .lock_sessions()
            .iter()
            .map(|(id, session)| (id.clone(), session.state.clone()))
            .collect())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, RuntimeError> {
        if self.fail_messages.load(Ordering::Relaxed) {
            return Err(RuntimeError::Rpc("injected messages failure".to_owned()));
        }
        self.lock_sessions()
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| RuntimeError::UnknownSession(session_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_prompt_and_fetch() {
        let mock = MockRuntimeClient::new();
        let id = mock
            .create_session(CreateSessionRequest {
                parent_id: Some("ses_parent".to_owned()),
                title: "retry of task 1".to_owned(),
            })
            .await
            .expect("create");
        assert_eq!(mock.parent_of(&id).as_deref(), Some("ses_parent"));

        mock.prompt(&id, "executor", "do the work").await.expect("prompt");
        assert_eq!(mock.prompts().len(), 1);

        mock.push_assistant_message(&id, 10, "done");
        let messages = mock.messages(&id).await.expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "done");
    }

    #[tokio::test]
    async fn test_status_reflects_idle_toggle() {
        let mock = MockRuntimeClient::new();
        let id = mock
            .create_session(CreateSessionRequest::default())
            .await
            .expect("create");
        assert_eq!(
            mock.status().await.expect("status").get(&id),
            Some(&SessionState::Busy)
        );
        mock.set_idle(&id, true);
        assert_eq!(
            mock.status().await.expect("status").get(&id),
            Some(&SessionState::Idle)
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockRuntimeClient::new();
        mock.fail_create(true);
        assert!(mock
            .create_session(CreateSessionRequest::default())
            .await
            .is_err());
        mock.fail_create(false);
        assert!(mock
            .create_session(CreateSessionRequest::default())
            .await
            .is_ok());
    }
}
