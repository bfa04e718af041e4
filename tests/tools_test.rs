#![allow(missing_docs)]
// Tool surface tests: the full dispatcher wired over a temp directory
// with the runtime mocked.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use armitage::kernel::activity::ActivityLogger;
use armitage::kernel::buffers::{PromptBuffer, SignalBuffer};
use armitage::kernel::ids::Clock;
use armitage::kernel::registry::{TaskRegistry, TaskSpec};
use armitage::kernel::stream::{EventStream, StreamConfig};
use armitage::ledger::LedgerStore;
use armitage::observer::{ExtractorConfig, LearningExtractor};
use armitage::runtime::mock::MockRuntimeClient;
use armitage::runtime::RuntimeClient;
use armitage::supervisor::{SupervisorConfig, TaskSupervisor};
use armitage::tools::{ToolSet, TOOL_NAMES};
use armitage::types::Complexity;

struct Harness {
    _dir: TempDir,
    base: std::path::PathBuf,
    tools: ToolSet,
    mock: Arc<MockRuntimeClient>,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join(".opencode");
    let clock = Arc::new(Clock::new());
    let stream = Arc::new(
        EventStream::new(StreamConfig::new(&base), Arc::clone(&clock)).expect("stream"),
    );
    stream.initialize().expect("stream init");
    let ledger = Arc::new(LedgerStore::new(&base, "ses_tools"));
    ledger.initialize().expect("ledger init");
    let registry = Arc::new(TaskRegistry::new(Arc::clone(&clock)));
    let mock = Arc::new(MockRuntimeClient::new());
    let supervisor = Arc::new(TaskSupervisor::new(
        SupervisorConfig::default(),
        Arc::clone(&registry),
        Arc::clone(&mock) as Arc<dyn RuntimeClient>,
        Arc::clone(&stream),
        Arc::new(SignalBuffer::new()),
        Arc::new(PromptBuffer::new()),
    ));
    let tools = ToolSet {
        ledger,
        registry,
        stream,
        extractor: Arc::new(LearningExtractor::new(ExtractorConfig::default())),
        supervisor,
        activity: Arc::new(ActivityLogger::new(&base).expect("activity")),
    };
    Harness {
        _dir: dir,
        base,
        tools,
        mock,
    }
}

#[tokio::test]
async fn test_ledger_tool_flow() {
    let harness = harness();

    let out = harness
        .tools
        .invoke(
            "ledger_create_epic",
            &json!({ "title": "Build Auth", "request": "OAuth please" }),
        )
        .await;
    assert_eq!(out["success"], true);
    let epic_id = out["epicId"].as_str().expect("epic id").to_owned();
    assert_eq!(epic_id.len(), 6);

    let out = harness
        .tools
        .invoke(
            "ledger_create_task",
            &json!({ "title": "Design schema", "agent": "planner" }),
        )
        .await;
    assert_eq!(out["success"], true);
    let task_id = out["taskId"].as_str().expect("task id").to_owned();
    assert_eq!(task_id, format!("{epic_id}.1"));

    let out = harness
        .tools
        .invoke(
            "ledger_update_task",
            &json!({ "taskId": task_id, "status": "completed", "result": "schema done" }),
        )
        .await;
    assert_eq!(out["success"], true);
    assert_eq!(out["outcome"], "SUCCEEDED");

    let out = harness.tools.invoke("ledger_status", &json!({})).await;
    assert_eq!(out["success"], true);
    assert_eq!(out["index"]["meta"]["tasksCompleted"], "1/1");

    let out = harness
        .tools
        .invoke("ledger_archive_epic", &json!({}))
        .await;
    assert_eq!(out["success"], true);
    assert_eq!(out["outcome"], "SUCCEEDED");
}

#[tokio::test]
async fn test_learning_tools() {
    let harness = harness();
    let out = harness
        .tools
        .invoke(
            "ledger_add_learning",
            &json!({ "kind": "antiPattern", "content": "never retry blindly" }),
        )
        .await;
    assert_eq!(out["success"], true);

    let out = harness
        .tools
        .invoke("ledger_get_learnings", &json!({ "kind": "antiPattern" }))
        .await;
    assert_eq!(out["success"], true);
    assert_eq!(out["learnings"][0]["content"], "never retry blindly");

    let out = harness
        .tools
        .invoke("ledger_add_learning", &json!({ "kind": "bogus", "content": "x" }))
        .await;
    assert_eq!(out["success"], false);
    assert!(out["hint"].as_str().is_some());
}

#[tokio::test]
async fn test_task_tools() {
    let harness = harness();
    harness.mock.seed_session("ses_work");
    harness
        .tools
        .registry
        .register(TaskSpec {
            id: Some("abc123.1".to_owned()),
            title: "implement".to_owned(),
            agent: "executor".to_owned(),
            prompt: "do it".to_owned(),
            session_id: "ses_work".to_owned(),
            parent_session_id: None,
            max_retries: 2,
            timeout_ms: 600_000,
            complexity: Complexity::Low,
        })
        .expect("register");

    let out = harness
        .tools
        .invoke("task_status", &json!({ "taskId": "abc123.1" }))
        .await;
    assert_eq!(out["success"], true);
    assert_eq!(out["task"]["status"], "pending");

    let out = harness
        .tools
        .invoke("task_heartbeat", &json!({ "taskId": "abc123.1" }))
        .await;
    assert_eq!(out["success"], true);

    let out = harness.tools.invoke("task_list", &json!({})).await;
    assert_eq!(out["tasks"].as_array().expect("array").len(), 1);

    let out = harness.tools.invoke("task_aggregate", &json!({})).await;
    assert_eq!(out["total"], 1);
    assert_eq!(out["pending"], 1);

    // Retry reissues into a fresh mock session.
    let out = harness
        .tools
        .invoke("task_retry", &json!({ "taskId": "abc123.1" }))
        .await;
    assert_eq!(out["success"], true);
    let task = harness.tools.registry.get("abc123.1").expect("task");
    assert_eq!(task.session_id, "mock_ses_0");
    assert_eq!(task.retry_count, 1);

    let out = harness
        .tools
        .invoke("task_kill", &json!({ "taskId": "abc123.1", "reason": "operator said stop" }))
        .await;
    assert_eq!(out["success"], true);
    let task = harness.tools.registry.get("abc123.1").expect("task");
    assert_eq!(
        task.error.as_deref(),
        Some("operator said stop"),
        "kill reason recorded"
    );

    let out = harness
        .tools
        .invoke("task_status", &json!({ "taskId": "ghost.9" }))
        .await;
    assert_eq!(out["success"], false);
}

#[tokio::test]
async fn test_observer_tools_and_unknown_name() {
    let harness = harness();

    let out = harness.tools.invoke("observer_stats", &json!({})).await;
    assert_eq!(out["success"], true);
    assert_eq!(out["enabled"], true);

    let out = harness
        .tools
        .invoke("observer_control", &json!({ "enabled": false }))
        .await;
    assert_eq!(out["success"], true);
    assert!(!harness.tools.extractor.is_enabled());

    let out = harness.tools.invoke("no_such_tool", &json!({})).await;
    assert_eq!(out["success"], false);
}

#[tokio::test]
async fn test_every_advertised_tool_dispatches() {
    let harness = harness();
    for name in TOOL_NAMES {
        let out = harness.tools.invoke(name, &json!({})).await;
        assert!(
            out.get("success").is_some(),
            "tool {name} must return the envelope"
        );
    }
}

#[tokio::test]
async fn test_invocations_land_in_activity_log() {
    let harness = harness();
    harness.tools.invoke("ledger_status", &json!({})).await;
    harness.tools.invoke("task_list", &json!({})).await;

    let body = std::fs::read_to_string(harness.base.join("activity.jsonl")).expect("read");
    let lines: Vec<&str> = body.trim().lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
    assert_eq!(first["action"], "ledger_status");
    assert_eq!(first["agent"], "tool-surface");
}
