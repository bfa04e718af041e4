//! Tool surface consumed by agents.
//!
//! Each tool is an async function taking typed dependencies plus JSON
//! input. Output is always a JSON envelope: `{"success": true, ...}` on
//! success, `{"success": false, "error": ..., "hint"?: ...}` on failure,
//! so agents can branch without parsing prose.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::kernel::activity::ActivityLogger;
use crate::kernel::registry::TaskRegistry;
use crate::kernel::stream::EventStream;
use crate::ledger::LedgerStore;
use crate::observer::LearningExtractor;
use crate::supervisor::TaskSupervisor;

pub mod ledger;
pub mod observer;
pub mod task;

/// Tool invocation errors (turned into the failure envelope).
#[derive(Debug, Error)]
pub enum ToolError {
    /// The input JSON is missing or malformed.
    #[error("{0}")]
    InvalidInput(String),
    /// The operation itself failed.
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// A hint an agent can act on, when one exists.
    fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInput(_) => Some("check the tool input fields"),
            Self::Failed(_) => None,
        }
    }
}

/// Success envelope with extra payload fields.
pub fn ok(mut fields: serde_json::Value) -> serde_json::Value {
    if let Some(map) = fields.as_object_mut() {
        map.insert("success".to_owned(), json!(true));
        return fields;
    }
    json!({ "success": true, "value": fields })
}

/// Failure envelope.
pub fn fail(error: &ToolError) -> serde_json::Value {
    match error.hint() {
        Some(hint) => json!({ "success": false, "error": error.to_string(), "hint": hint }),
        None => json!({ "success": false, "error": error.to_string() }),
    }
}

/// Everything the tool surface needs.
pub struct ToolSet {
    /// The ledger store.
    pub ledger: Arc<LedgerStore>,
    /// The task registry.
    pub registry: Arc<TaskRegistry>,
    /// The event stream.
    pub stream: Arc<EventStream>,
    /// The learning extractor.
    pub extractor: Arc<LearningExtractor>,
    /// The task supervisor.
    pub supervisor: Arc<TaskSupervisor>,
    /// Activity log receiving one line per invocation.
    pub activity: Arc<ActivityLogger>,
}

/// Stable tool names, in the order they are advertised.
pub const TOOL_NAMES: &[&str] = &[
    "ledger_status",
    "ledger_create_epic",
    "ledger_create_task",
    "ledger_update_task",
    "ledger_add_learning",
    "ledger_get_learnings",
    "ledger_add_context",
    "ledger_create_handoff",
    "ledger_archive_epic",
    "task_status",
    "task_aggregate",
    "task_heartbeat",
    "task_retry",
    "task_kill",
    "task_fetch_context",
    "task_list",
    "observer_stats",
    "observer_control",
];

impl ToolSet {
    /// Dispatch one tool invocation by name.
    ///
    /// Unknown names return the failure envelope rather than an error;
    /// the tool surface never panics an agent.
    pub async fn invoke(&self, name: &str, input: &serde_json::Value) -> serde_json::Value {
        let result = match name {
            "ledger_status" => ledger::status(&self.ledger),
            "ledger_create_epic" => ledger::create_epic(&self.ledger, input),
            "ledger_create_task" => ledger::create_task(&self.ledger, input),
            "ledger_update_task" => ledger::update_task(&self.ledger, input),
            "ledger_add_learning" => ledger::add_learning(&self.ledger, input),
            "ledger_get_learnings" => ledger::get_learnings(&self.ledger, input),
            "ledger_add_context" => ledger::add_context(&self.ledger, input),
            "ledger_create_handoff" => ledger::create_handoff(&self.ledger, input),
            "ledger_archive_epic" => ledger::archive_epic(&self.ledger, input),
            "task_status" => task::status(&self.registry, input),
            "task_aggregate" => task::aggregate(&self.registry),
            "task_heartbeat" => task::heartbeat(&self.registry, input),
            "task_retry" => task::retry(&self.supervisor, input).await,
            "task_kill" => task::kill(&self.supervisor, input).await,
            "task_fetch_context" => task::fetch_context(&self.stream, input),
            "task_list" => task::list(&self.registry),
            "observer_stats" => observer::stats(&self.extractor),
            "observer_control" => observer::control(&self.extractor, input),
            other => Err(ToolError::InvalidInput(format!("unknown tool: {other}"))),
        };
        let output = match result {
            Ok(value) => value,
            Err(error) => fail(&error),
        };
        let success = output.get("success").and_then(serde_json::Value::as_bool);
        if let Err(e) = self.activity.record_action(
            "",
            "tool-surface",
            name,
            json!({ "success": success }),
        ) {
            warn!(tool = name, error = %e, "activity record failed");
        }
        output
    }
}

/// Required string field helper shared by the tool modules.
fn require_str<'a>(input: &'a serde_json::Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing required field: {field}")))
}
