#![allow(missing_docs)]
// End-to-end flows across the core: ledger + registry + supervisor +
// stream recovery + buffers, driven through the public API with the
// runtime mocked.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use armitage::kernel::buffers::{PromptBuffer, SignalBuffer};
use armitage::kernel::bridge::LedgerEventBridge;
use armitage::kernel::guard::can_call_agent;
use armitage::kernel::ids::Clock;
use armitage::kernel::registry::{TaskRegistry, TaskSpec};
use armitage::kernel::stream::{EventStream, StreamConfig};
use armitage::ledger::{LedgerStore, LedgerSync};
use armitage::runtime::mock::MockRuntimeClient;
use armitage::runtime::RuntimeClient;
use armitage::supervisor::{SupervisorConfig, TaskSupervisor};
use armitage::types::{Complexity, EventType, SignalKind, SignalPayload, TaskStatus};

struct Harness {
    _dir: TempDir,
    base: std::path::PathBuf,
    clock: Arc<Clock>,
    stream: Arc<EventStream>,
    ledger: Arc<LedgerStore>,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join(".opencode");
    let clock = Arc::new(Clock::new());
    let stream = Arc::new(
        EventStream::new(StreamConfig::new(&base), Arc::clone(&clock)).expect("stream"),
    );
    stream.initialize().expect("stream init");
    let bridge = Arc::new(LedgerEventBridge::new(Arc::clone(&stream), "ses_main"));
    let ledger =
        Arc::new(LedgerStore::new(&base, "ses_main").with_bridge(bridge));
    ledger.initialize().expect("ledger init");
    Harness {
        _dir: dir,
        base,
        clock,
        stream,
        ledger,
    }
}

// ── Ledger mutations emit events and survive replay ──

#[test]
fn test_ledger_mutations_flow_into_stream_and_replay() {
    let harness = harness();

    harness
        .ledger
        .create_epic("Build Auth", "User requested OAuth")
        .expect("epic");
    let task = harness
        .ledger
        .create_task("Design schema", "planner", vec![])
        .expect("task");
    harness
        .ledger
        .update_task_status(&task.id, TaskStatus::Completed, Some("done".to_owned()), None)
        .expect("complete");

    let history = harness.stream.get_event_history(None, 100);
    let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"ledger.epic.created"));
    assert!(types.contains(&"ledger.task.created"));
    assert!(types.contains(&"ledger.task.completed"));

    // A fresh stream over the same directory replays the same events.
    let reopened = EventStream::new(
        StreamConfig::new(&harness.base),
        Arc::new(Clock::new()),
    )
    .expect("stream");
    let report = reopened.initialize().expect("init");
    assert_eq!(
        usize::try_from(report.events_replayed).expect("fits"),
        history.len()
    );
    assert_eq!(reopened.get_event_history(None, 100), history);
}

// ── Supervisor end-to-end with ledger sync ──

#[tokio::test]
async fn test_supervised_task_completion_mirrors_into_ledger() {
    let harness = harness();
    let mock = Arc::new(MockRuntimeClient::new());

    harness.ledger.create_epic("Ship it", "request").expect("epic");
    let ledger_task = harness
        .ledger
        .create_task("Implement", "executor", vec![])
        .expect("task");

    let registry = Arc::new(TaskRegistry::with_sink(
        Arc::clone(&harness.clock),
        Arc::new(LedgerSync::new(Arc::clone(&harness.ledger))),
    ));

    mock.seed_session("ses_work");
    registry
        .register(TaskSpec {
            id: Some(ledger_task.id.clone()),
            title: ledger_task.title.clone(),
            agent: "executor".to_owned(),
            prompt: "implement it".to_owned(),
            session_id: "ses_work".to_owned(),
            parent_session_id: None,
            max_retries: 2,
            timeout_ms: 600_000,
            complexity: Complexity::Low,
        })
        .expect("register");
    registry
        .update_status(&ledger_task.id, TaskStatus::Running, None, None)
        .expect("running");

    let supervisor = TaskSupervisor::new(
        SupervisorConfig::default(),
        Arc::clone(&registry),
        Arc::clone(&mock) as Arc<dyn RuntimeClient>,
        Arc::clone(&harness.stream),
        Arc::new(SignalBuffer::new()),
        Arc::new(PromptBuffer::new()),
    );

    mock.set_idle("ses_work", true);
    mock.push_assistant_message("ses_work", 5, "implemented and tested");
    let report = supervisor.check_now().await;
    assert_eq!(report.results_fetched, 1);

    // The registry completion was mirrored into the ledger files.
    let status = harness.ledger.status().expect("status");
    assert_eq!(status.index.meta.tasks_completed.as_deref(), Some("1/1"));
    let epic = status.epic.expect("epic");
    assert_eq!(epic.tasks[0].status, TaskStatus::Completed);
    assert_eq!(
        epic.tasks[0].result.as_deref(),
        Some("implemented and tested")
    );
}

// ── Checkpoint recovery across restart ──

#[test]
fn test_pending_checkpoint_survives_restart() {
    let harness = harness();
    let checkpoint = harness
        .stream
        .request_checkpoint("ses_main", "executor", "deploy now?", vec![])
        .expect("request");

    let reopened = EventStream::new(
        StreamConfig::new(&harness.base),
        Arc::new(Clock::new()),
    )
    .expect("stream");
    let report = reopened.initialize().expect("init");
    assert_eq!(report.pending_checkpoints.len(), 1);
    assert_eq!(report.pending_checkpoints[0].id, checkpoint.id);

    // Approving on the recovered stream resolves it.
    assert!(reopened
        .approve_checkpoint(&checkpoint.id, "user", None)
        .expect("approve"));
    assert!(reopened.get_pending_checkpoints().is_empty());
}

// ── Signal FIFO semantics ──

#[test]
fn test_signal_fifo_for_busy_parent() {
    let buffer = SignalBuffer::new();
    let a = buffer.enqueue(
        "child-a",
        "parent-2",
        SignalPayload {
            kind: SignalKind::AskUser,
            data: serde_json::json!({"question": "merge?"}),
            reason: "ambiguous requirement".to_owned(),
        },
    );
    let b = buffer.enqueue(
        "child-b",
        "parent-2",
        SignalPayload {
            kind: SignalKind::LogMetric,
            data: serde_json::json!({"tokens": 1200}),
            reason: "usage report".to_owned(),
        },
    );

    let flushed = buffer.flush("parent-2");
    assert_eq!(flushed.len(), 2);
    assert_eq!(flushed[0].id, a.id);
    assert_eq!(flushed[1].id, b.id);
    assert!(!buffer.has_signals("parent-2"));
}

// ── Access control regressions ──

#[test]
fn test_access_control_scenarios() {
    let denied = can_call_agent("random-worker", "oracle", true);
    assert!(!denied.allowed);
    assert_eq!(
        denied.reason.as_deref(),
        Some("The oracle agent only responds to chief-of-staff.")
    );

    assert!(can_call_agent("", "Code", false).allowed);
    assert!(!can_call_agent("random-worker", "chief-of-staff/oracle", false).allowed);
}

// ── Context snapshot round trip through a restart ──

#[test]
fn test_snapshot_restores_after_restart() {
    use armitage::types::{AgentContext, LedgerStateSummary, Phase};

    let harness = harness();
    harness
        .stream
        .create_context_snapshot(AgentContext {
            session_id: "ses_work".to_owned(),
            agent_name: "executor".to_owned(),
            prompt: "finish the migration".to_owned(),
            memories: vec!["db is postgres 16".to_owned()],
            ledger_state: LedgerStateSummary {
                epic_id: None,
                task_id: None,
                phase: Phase::Execute,
                completed_tasks: vec![],
                pending_tasks: vec![],
            },
            recent_events: vec![],
        })
        .expect("snapshot");

    let reopened = EventStream::new(
        StreamConfig::new(&harness.base),
        Arc::new(Clock::new()),
    )
    .expect("stream");
    reopened.initialize().expect("init");
    let restored = reopened
        .restore_context("ses_work")
        .expect("restore")
        .expect("present");
    assert_eq!(restored.prompt, "finish the migration");
    assert_eq!(restored.memories, vec!["db is postgres 16".to_owned()]);
}

// ── Supervisor stop is prompt even with work queued ──

#[tokio::test]
async fn test_supervisor_shutdown_order() {
    let harness = harness();
    let mock = Arc::new(MockRuntimeClient::new());
    let registry = Arc::new(TaskRegistry::new(Arc::clone(&harness.clock)));

    let supervisor = Arc::new(TaskSupervisor::new(
        SupervisorConfig::default(),
        registry,
        mock as Arc<dyn RuntimeClient>,
        Arc::clone(&harness.stream),
        Arc::new(SignalBuffer::new()),
        Arc::new(PromptBuffer::new()),
    ));

    let handle = tokio::spawn(Arc::clone(&supervisor).run());
    tokio::time::sleep(Duration::from_millis(10)).await;
    supervisor.stop();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("prompt shutdown")
        .expect("join");

    harness.stream.shutdown();
    let err = harness
        .stream
        .append(armitage::kernel::stream::EventDraft {
            event_type: Some(EventType::TaskProgress),
            session_id: "ses_main".to_owned(),
            actor: "user".to_owned(),
            payload: serde_json::json!({}),
            ..Default::default()
        })
        .expect_err("closed stream refuses appends");
    assert!(matches!(
        err,
        armitage::kernel::stream::StreamError::NotInitialized
    ));
}
