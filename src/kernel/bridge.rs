//! Bridge between ledger mutations and the event stream.
//!
//! Ledger operations are wired to call [`LedgerEventBridge::emit`] as a
//! post-mutation hook. The bridge only ever calls `stream.append`, which
//! keeps the stream a leaf dependency: the ledger never holds a stream
//! subscription and the stream knows nothing about ledger types.

use std::sync::Arc;

use thiserror::Error;

use crate::kernel::stream::{EventDraft, EventStream, ResumeReport, StreamError};
use crate::types::{Event, EventType};

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Only `ledger.*` events go through the bridge.
    #[error("not a ledger event type: {0}")]
    NotLedgerEvent(String),
    /// Stream failure underneath.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Emits typed `ledger.*` events into the stream.
pub struct LedgerEventBridge {
    stream: Arc<EventStream>,
    session_id: String,
}

impl LedgerEventBridge {
    /// Create a bridge bound to the session driving the ledger.
    pub fn new(stream: Arc<EventStream>, session_id: impl Into<String>) -> Self {
        Self {
            stream,
            session_id: session_id.into(),
        }
    }

    /// Resume the stream so lineage reflects recovered history.
    pub fn initialize(&self) -> Result<ResumeReport, BridgeError> {
        Ok(self.stream.resume()?)
    }

    /// Emit a ledger event, optionally chained to its causing event.
    pub fn emit(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        causation_id: Option<&str>,
    ) -> Result<Event, BridgeError> {
        if !event_type.as_str().starts_with("ledger.") {
            return Err(BridgeError::NotLedgerEvent(event_type.to_string()));
        }
        let event = self.stream.append(EventDraft {
            event_type: Some(event_type),
            session_id: self.session_id.clone(),
            actor: "ledger".to_owned(),
            payload,
            parent_event_id: causation_id.map(str::to_owned),
            ..EventDraft::default()
        })?;
        Ok(event)
    }

    /// The stream this bridge writes to.
    pub fn stream(&self) -> &Arc<EventStream> {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ids::Clock;
    use crate::kernel::stream::StreamConfig;
    use tempfile::TempDir;

    fn bridge_in(dir: &TempDir) -> LedgerEventBridge {
        let stream = Arc::new(
            EventStream::new(
                StreamConfig::new(dir.path().join(".opencode")),
                Arc::new(Clock::new()),
            )
            .expect("create stream"),
        );
        stream.initialize().expect("initialize");
        LedgerEventBridge::new(stream, "ses_main")
    }

    #[test]
    fn test_emit_ledger_event() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_in(&dir);

        let event = bridge
            .emit(
                EventType::LedgerEpicCreated,
                serde_json::json!({ "epicId": "a3f29c" }),
                None,
            )
            .expect("emit");
        assert_eq!(event.event_type, EventType::LedgerEpicCreated);
        assert_eq!(event.actor, "ledger");
        assert_eq!(event.session_id, "ses_main");
    }

    #[test]
    fn test_emit_rejects_non_ledger_types() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_in(&dir);

        let err = bridge
            .emit(EventType::AgentCompleted, serde_json::json!({}), None)
            .expect_err("must reject");
        assert!(matches!(err, BridgeError::NotLedgerEvent(_)));
    }

    #[test]
    fn test_emit_with_causation_builds_lineage() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_in(&dir);

        let parent = bridge
            .emit(
                EventType::LedgerEpicCreated,
                serde_json::json!({ "epicId": "a3f29c" }),
                None,
            )
            .expect("emit parent");
        let child = bridge
            .emit(
                EventType::LedgerTaskCreated,
                serde_json::json!({ "taskId": "a3f29c.1" }),
                Some(&parent.id),
            )
            .expect("emit child");

        assert_eq!(bridge.stream().get_descendants(&parent.id), vec![child.id]);
    }

    #[test]
    fn test_initialize_resumes_stream() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_in(&dir);
        bridge
            .emit(EventType::LedgerEpicCreated, serde_json::json!({}), None)
            .expect("emit");

        let report = bridge.initialize().expect("initialize");
        assert_eq!(report.events_replayed, 1);
    }
}
