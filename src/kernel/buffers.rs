//! Per-session queues for upward signals and deferred prompts.
//!
//! A child agent that needs its parent (ask the user something, spawn a
//! helper, record a metric) enqueues an upward signal; the parent drains
//! its queue when it next goes idle. Deferred prompts work the same way
//! for messages that must wait for an idle target session. Both queues
//! are in-memory and FIFO; crash persistence rides on the ledger's
//! suspended task state.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::kernel::ids;
use crate::types::{DeferredPrompt, SignalPayload, UpwardSignal};

/// FIFO queues of upward signals keyed by target session.
#[derive(Debug, Default)]
pub struct SignalBuffer {
    queues: Mutex<HashMap<String, Vec<UpwardSignal>>>,
}

impl SignalBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a signal for a target session. Returns the stored signal.
    pub fn enqueue(
        &self,
        source_agent: &str,
        target_session_id: &str,
        payload: SignalPayload,
    ) -> UpwardSignal {
        let signal = UpwardSignal {
            id: ids::signal_id(),
            source_agent: source_agent.to_owned(),
            target_session_id: target_session_id.to_owned(),
            payload,
            created_at: Utc::now(),
        };
        self.lock()
            .entry(target_session_id.to_owned())
            .or_default()
            .push(signal.clone());
        signal
    }

    /// Whether any signals wait for this session.
    pub fn has_signals(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Drain the queue for a session, removing it. FIFO order.
    pub fn flush(&self, session_id: &str) -> Vec<UpwardSignal> {
        self.lock().remove(session_id).unwrap_or_default()
    }

    /// Drop every queue.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Total queued signals across all sessions.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Whether no signals are queued anywhere.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<UpwardSignal>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// FIFO queues of prompts held until the target session is idle.
#[derive(Debug, Default)]
pub struct PromptBuffer {
    queues: Mutex<HashMap<String, Vec<DeferredPrompt>>>,
}

impl PromptBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a prompt for later delivery. Returns the stored prompt.
    pub fn enqueue(
        &self,
        target_session_id: &str,
        agent: &str,
        prompt: &str,
        message_id: Option<String>,
    ) -> DeferredPrompt {
        let deferred = DeferredPrompt {
            id: ids::prompt_id(),
            target_session_id: target_session_id.to_owned(),
            agent: agent.to_owned(),
            prompt: prompt.to_owned(),
            message_id,
            created_at: Utc::now(),
            attempts: 0,
        };
        self.lock()
            .entry(target_session_id.to_owned())
            .or_default()
            .push(deferred.clone());
        deferred
    }

    /// Whether any prompts wait for this session.
    pub fn has_prompts(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Drain the queue for a session, bumping each prompt's attempt
    /// counter. FIFO order.
    pub fn flush(&self, session_id: &str) -> Vec<DeferredPrompt> {
        let mut drained = self.lock().remove(session_id).unwrap_or_default();
        for prompt in &mut drained {
            prompt.attempts = prompt.attempts.saturating_add(1);
        }
        drained
    }

    /// Re-queue prompts whose delivery failed, keeping their order ahead
    /// of anything enqueued since.
    pub fn requeue_front(&self, session_id: &str, prompts: Vec<DeferredPrompt>) {
        if prompts.is_empty() {
            return;
        }
        let mut queues = self.lock();
        let queue = queues.entry(session_id.to_owned()).or_default();
        let mut merged = prompts;
        merged.append(queue);
        *queue = merged;
    }

    /// Drop every queue.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<DeferredPrompt>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;

    fn ask_user(reason: &str) -> SignalPayload {
        SignalPayload {
            kind: SignalKind::AskUser,
            data: serde_json::json!({ "question": "which branch?" }),
            reason: reason.to_owned(),
        }
    }

    // ── Signal buffer ──

    #[test]
    fn test_signal_fifo_flush() {
        let buffer = SignalBuffer::new();
        let a = buffer.enqueue("child-a", "parent-2", ask_user("first"));
        let b = buffer.enqueue("child-b", "parent-2", ask_user("second"));

        assert!(buffer.has_signals("parent-2"));
        let flushed = buffer.flush("parent-2");
        assert_eq!(
            flushed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str()],
            "flush preserves enqueue order"
        );
        assert!(!buffer.has_signals("parent-2"), "flush removes the queue");
    }

    #[test]
    fn test_signal_queues_are_per_target() {
        let buffer = SignalBuffer::new();
        buffer.enqueue("child", "parent-1", ask_user("one"));
        buffer.enqueue("child", "parent-2", ask_user("two"));

        assert_eq!(buffer.flush("parent-1").len(), 1);
        assert!(buffer.has_signals("parent-2"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_signal_clear() {
        let buffer = SignalBuffer::new();
        buffer.enqueue("child", "parent-1", ask_user("one"));
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_unknown_session_is_empty() {
        let buffer = SignalBuffer::new();
        assert!(buffer.flush("nobody").is_empty());
    }

    // ── Prompt buffer ──

    #[test]
    fn test_prompt_flush_counts_attempts() {
        let buffer = PromptBuffer::new();
        buffer.enqueue("ses_1", "executor", "continue the task", None);

        let drained = buffer.flush("ses_1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].attempts, 1);
        assert!(!buffer.has_prompts("ses_1"));
    }

    #[test]
    fn test_prompt_requeue_front_keeps_order() {
        let buffer = PromptBuffer::new();
        let first = buffer.enqueue("ses_1", "executor", "first", None);
        let failed = buffer.flush("ses_1");
        assert_eq!(failed[0].id, first.id);

        // A new prompt arrives while delivery was failing.
        buffer.enqueue("ses_1", "executor", "second", None);
        buffer.requeue_front("ses_1", failed);

        let drained = buffer.flush("ses_1");
        assert_eq!(drained[0].prompt, "first");
        assert_eq!(drained[1].prompt, "second");
        assert_eq!(drained[0].attempts, 2, "second delivery attempt");
    }
}
