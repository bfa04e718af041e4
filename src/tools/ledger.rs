//! `ledger_*` tools: epic, task, learning, context, handoff, archive.

use serde_json::json;

use crate::ledger::model::{Handoff, HandoffReason};
use crate::ledger::markdown;
use crate::ledger::{LedgerError, LedgerStore};
use crate::types::{Outcome, TaskStatus};

use super::{ok, require_str, ToolError};

impl From<LedgerError> for ToolError {
    fn from(e: LedgerError) -> Self {
        ToolError::Failed(e.to_string())
    }
}

/// `ledger_status`: the compact index plus the active epic.
pub fn status(store: &LedgerStore) -> Result<serde_json::Value, ToolError> {
    let status = store.status()?;
    Ok(ok(json!({
        "index": status.index,
        "epic": status.epic,
    })))
}

/// `ledger_create_epic` input: `{title, request}`.
pub fn create_epic(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let title = require_str(input, "title")?;
    let request = require_str(input, "request")?;
    let epic = store.create_epic(title, request)?;
    Ok(ok(json!({ "epicId": epic.id, "status": epic.status })))
}

/// `ledger_create_task` input: `{title, agent, dependencies?}`.
pub fn create_task(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let title = require_str(input, "title")?;
    let agent = require_str(input, "agent")?;
    let dependencies = input
        .get("dependencies")
        .and_then(|v| v.as_array())
        .map(|deps| {
            deps.iter()
                .filter_map(|d| d.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    let task = store.create_task(title, agent, dependencies)?;
    Ok(ok(json!({ "taskId": task.id })))
}

/// `ledger_update_task` input: `{taskId, status, result?, error?}`.
pub fn update_task(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let task_id = require_str(input, "taskId")?;
    let status = parse_status(require_str(input, "status")?)?;
    let result = input
        .get("result")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let error = input
        .get("error")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let task = store.update_task_status(task_id, status, result, error)?;
    Ok(ok(json!({ "taskId": task.id, "status": task.status, "outcome": task.outcome })))
}

/// `ledger_add_learning` input: `{kind, content}`.
pub fn add_learning(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let kind = markdown::parse_kind(require_str(input, "kind")?)
        .ok_or_else(|| ToolError::InvalidInput("unknown learning kind".to_owned()))?;
    let content = require_str(input, "content")?;
    store.add_learning(kind, content)?;
    Ok(ok(json!({})))
}

/// `ledger_get_learnings` input: `{kind?, limit?}`.
pub fn get_learnings(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let kind = match input.get("kind").and_then(|v| v.as_str()) {
        Some(tag) => Some(
            markdown::parse_kind(tag)
                .ok_or_else(|| ToolError::InvalidInput("unknown learning kind".to_owned()))?,
        ),
        None => None,
    };
    let limit = input
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(10);
    let learnings: Vec<serde_json::Value> = store
        .get_learnings(kind, limit)?
        .into_iter()
        .map(|l| json!({ "kind": markdown::kind_str(l.kind), "content": l.content }))
        .collect();
    Ok(ok(json!({ "learnings": learnings })))
}

/// `ledger_add_context` input: `{note}`.
pub fn add_context(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let note = require_str(input, "note")?;
    store.add_context(note)?;
    Ok(ok(json!({})))
}

/// `ledger_create_handoff` input: `{reason, resumeCommand, summary,
/// whatsDone?, whatsNext?, keyContext?, filesModified?}`.
pub fn create_handoff(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let reason = HandoffReason::parse(require_str(input, "reason")?)
        .ok_or_else(|| ToolError::InvalidInput("unknown handoff reason".to_owned()))?;
    let handoff = Handoff {
        reason,
        resume_command: require_str(input, "resumeCommand")?.to_owned(),
        summary: require_str(input, "summary")?.to_owned(),
        files_modified: string_list(input, "filesModified"),
        whats_done: string_list(input, "whatsDone"),
        whats_next: string_list(input, "whatsNext"),
        key_context: string_list(input, "keyContext"),
    };
    store.create_handoff(handoff)?;
    Ok(ok(json!({})))
}

/// `ledger_archive_epic` input: `{outcome?}`.
pub fn archive_epic(
    store: &LedgerStore,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let outcome = match input.get("outcome").and_then(|v| v.as_str()) {
        Some("SUCCEEDED") => Some(Outcome::Succeeded),
        Some("PARTIAL") => Some(Outcome::Partial),
        Some("FAILED") => Some(Outcome::Failed),
        Some(_) => return Err(ToolError::InvalidInput("unknown outcome".to_owned())),
        None => None,
    };
    let epic = store.archive_epic(outcome)?;
    Ok(ok(json!({ "epicId": epic.id, "outcome": epic.outcome })))
}

fn parse_status(s: &str) -> Result<TaskStatus, ToolError> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "timeout" => Ok(TaskStatus::Timeout),
        other => Err(ToolError::InvalidInput(format!("unknown status: {other}"))),
    }
}

fn string_list(input: &serde_json::Value, field: &str) -> Vec<String> {
    input
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}
