//! `task_*` tools: registry queries, heartbeats, retry, kill, context.

use serde_json::json;

use crate::kernel::registry::{RegistryTask, TaskRegistry};
use crate::kernel::stream::EventStream;
use crate::supervisor::TaskSupervisor;
use crate::types::TaskStatus;

use super::{ok, require_str, ToolError};

fn task_json(task: &RegistryTask) -> serde_json::Value {
    json!({
        "taskId": task.id,
        "title": task.title,
        "agent": task.agent,
        "status": task.status,
        "sessionId": task.session_id,
        "retryCount": task.retry_count,
        "maxRetries": task.max_retries,
        "result": task.result,
        "error": task.error,
    })
}

/// `task_status` input: `{taskId}`.
pub fn status(
    registry: &TaskRegistry,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let task_id = require_str(input, "taskId")?;
    let task = registry
        .get(task_id)
        .ok_or_else(|| ToolError::Failed(format!("task not found: {task_id}")))?;
    Ok(ok(json!({ "task": task_json(&task) })))
}

/// `task_aggregate`: counts by status plus completed results.
pub fn aggregate(registry: &TaskRegistry) -> Result<serde_json::Value, ToolError> {
    let tasks = registry.all();
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    let results: Vec<serde_json::Value> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| json!({ "taskId": t.id, "result": t.result }))
        .collect();
    Ok(ok(json!({
        "total": tasks.len(),
        "pending": count(TaskStatus::Pending),
        "running": count(TaskStatus::Running),
        "completed": count(TaskStatus::Completed),
        "failed": count(TaskStatus::Failed),
        "timeout": count(TaskStatus::Timeout),
        "results": results,
    })))
}

/// `task_heartbeat` input: `{taskId}`.
pub fn heartbeat(
    registry: &TaskRegistry,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let task_id = require_str(input, "taskId")?;
    registry
        .heartbeat(task_id)
        .map_err(|e| ToolError::Failed(e.to_string()))?;
    Ok(ok(json!({})))
}

/// `task_retry` input: `{taskId}`. Forces an immediate reissue.
pub async fn retry(
    supervisor: &TaskSupervisor,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let task_id = require_str(input, "taskId")?;
    if !supervisor.retry_now(task_id).await {
        return Err(ToolError::Failed(format!("task not found: {task_id}")));
    }
    Ok(ok(json!({ "taskId": task_id })))
}

/// `task_kill` input: `{taskId, reason?}`.
pub async fn kill(
    supervisor: &TaskSupervisor,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let task_id = require_str(input, "taskId")?;
    let reason = input
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("killed by operator");
    if !supervisor.kill(task_id, reason).await {
        return Err(ToolError::Failed(format!("task not found: {task_id}")));
    }
    Ok(ok(json!({ "taskId": task_id })))
}

/// `task_fetch_context` input: `{sessionId}`. Restores a snapshot.
pub fn fetch_context(
    stream: &EventStream,
    input: &serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let session_id = require_str(input, "sessionId")?;
    let context = stream
        .restore_context(session_id)
        .map_err(|e| ToolError::Failed(e.to_string()))?;
    match context {
        Some(context) => Ok(ok(json!({ "context": context }))),
        None => Err(ToolError::Failed(format!(
            "no snapshot for session: {session_id}"
        ))),
    }
}

/// `task_list`: every registry task.
pub fn list(registry: &TaskRegistry) -> Result<serde_json::Value, ToolError> {
    let mut tasks = registry.all();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    let tasks: Vec<serde_json::Value> = tasks.iter().map(task_json).collect();
    Ok(ok(json!({ "tasks": tasks })))
}
