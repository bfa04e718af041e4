//! In-memory task registry: the runtime twin of the ledger's task list.
//!
//! Keyed by task id (usually the ledger id `<epic>.<n>`). The supervisor
//! polls this table for timeouts and stale heartbeats; every method is
//! atomic behind one lock and iteration results are snapshots, so callers
//! never observe a half-applied mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::kernel::ids::{self, Clock};
use crate::types::{Complexity, TaskStatus};

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(String),
    /// A task with this id is already registered.
    #[error("task already registered: {0}")]
    Duplicate(String),
}

/// Sink mirroring registry status changes into the ledger.
///
/// Wired as a post-mutation hook so the registry never depends on the
/// ledger's types directly.
pub trait StatusSink: Send + Sync {
    /// Called after a task's status changed.
    fn task_status_changed(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    );
}

/// Specification for registering a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Ledger task id to reuse; a fresh id is generated when absent.
    pub id: Option<String>,
    /// Short task title.
    pub title: String,
    /// Agent the task is dispatched to.
    pub agent: String,
    /// Prompt handed to the agent (kept for retries).
    pub prompt: String,
    /// Session the current attempt runs in.
    pub session_id: String,
    /// Session of the dispatching parent, if any.
    pub parent_session_id: Option<String>,
    /// Retry budget.
    pub max_retries: u32,
    /// Per-attempt time budget in milliseconds.
    pub timeout_ms: i64,
    /// Complexity estimate for adaptive polling.
    pub complexity: Complexity,
}

/// Runtime state of one supervised task.
#[derive(Debug, Clone)]
pub struct RegistryTask {
    /// Task id, shared with the ledger when supplied at registration.
    pub id: String,
    /// Short task title.
    pub title: String,
    /// Agent the task is dispatched to.
    pub agent: String,
    /// Prompt handed to the agent (reused verbatim on retry).
    pub prompt: String,
    /// Session of the current attempt; replaced on retry.
    pub session_id: String,
    /// Session of the dispatching parent, if any.
    pub parent_session_id: Option<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Final output once completed.
    pub result: Option<String>,
    /// Error once failed.
    pub error: Option<String>,
    /// Retry budget.
    pub max_retries: u32,
    /// Retries consumed.
    pub retry_count: u32,
    /// Per-attempt time budget in milliseconds.
    pub timeout_ms: i64,
    /// Complexity estimate for adaptive polling.
    pub complexity: Complexity,
    /// Registration time (unix ms).
    pub created_at: i64,
    /// When the task entered `running` (unix ms).
    pub started_at: Option<i64>,
    /// When the task reached a terminal state (unix ms).
    pub completed_at: Option<i64>,
    /// Last liveness signal (unix ms).
    pub last_heartbeat: i64,
}

/// Thread-safe in-memory task table.
pub struct TaskRegistry {
    clock: Arc<Clock>,
    tasks: Mutex<HashMap<String, RegistryTask>>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Create a registry that mirrors status changes into `sink`.
    pub fn with_sink(clock: Arc<Clock>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Register a task. Returns its id.
    pub fn register(&self, spec: TaskSpec) -> Result<String, RegistryError> {
        let now = self.clock.now_ms();
        let id = spec.id.unwrap_or_else(ids::session_id);
        let mut tasks = self.lock();
        if tasks.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        debug!(task_id = %id, agent = %spec.agent, "task registered");
        tasks.insert(
            id.clone(),
            RegistryTask {
                id: id.clone(),
                title: spec.title,
                agent: spec.agent,
                prompt: spec.prompt,
                session_id: spec.session_id,
                parent_session_id: spec.parent_session_id,
                status: TaskStatus::Pending,
                result: None,
                error: None,
                max_retries: spec.max_retries,
                retry_count: 0,
                timeout_ms: spec.timeout_ms,
                complexity: spec.complexity,
                created_at: now,
                started_at: None,
                completed_at: None,
                last_heartbeat: now,
            },
        );
        Ok(id)
    }

    /// Transition a task's status, recording result or error.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        {
            let mut tasks = self.lock();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
            task.status = status;
            if status == TaskStatus::Running && task.started_at.is_none() {
                task.started_at = Some(now);
                task.last_heartbeat = now;
            }
            if status.is_terminal() {
                task.completed_at = Some(now);
            }
            if let Some(result) = result.clone() {
                task.result = Some(result);
            }
            if let Some(error) = error.clone() {
                task.error = Some(error);
            }
        }
        if let Some(sink) = &self.sink {
            sink.task_status_changed(id, status, result.as_deref(), error.as_deref());
        }
        Ok(())
    }

    /// Record a liveness signal. Never transitions status.
    pub fn heartbeat(&self, id: &str) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        task.last_heartbeat = now;
        Ok(())
    }

    /// Bump the retry counter. Returns the new count.
    pub fn increment_retry(&self, id: &str) -> Result<u32, RegistryError> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        task.retry_count = task.retry_count.saturating_add(1);
        Ok(task.retry_count)
    }

    /// Point the task at a fresh session (retry reissue).
    ///
    /// Resets the attempt clock and heartbeat so the new attempt gets a
    /// full time budget.
    pub fn update_session_id(&self, id: &str, session_id: &str) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        task.session_id = session_id.to_owned();
        task.started_at = Some(now);
        task.last_heartbeat = now;
        Ok(())
    }

    /// Fetch a task snapshot.
    pub fn get(&self, id: &str) -> Option<RegistryTask> {
        self.lock().get(id).cloned()
    }

    /// Running tasks past their per-attempt time budget.
    pub fn get_timed_out_tasks(&self) -> Vec<RegistryTask> {
        let now = self.clock.now_ms();
        self.lock()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at
                        .is_some_and(|started| now.saturating_sub(started) > t.timeout_ms)
            })
            .cloned()
            .collect()
    }

    /// Running tasks whose heartbeat went stale.
    pub fn get_stuck_tasks(&self, threshold_ms: i64) -> Vec<RegistryTask> {
        let now = self.clock.now_ms();
        self.lock()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && now.saturating_sub(t.last_heartbeat) > threshold_ms
            })
            .cloned()
            .collect()
    }

    /// Snapshot of tasks in a given status.
    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<RegistryTask> {
        self.lock()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Snapshot of every task.
    pub fn all(&self) -> Vec<RegistryTask> {
        self.lock().values().cloned().collect()
    }

    /// Drop terminal tasks older than `max_age_ms`. Returns how many.
    pub fn cleanup(&self, max_age_ms: i64) -> usize {
        let now = self.clock.now_ms();
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal()
                && t.completed_at
                    .is_some_and(|done| now.saturating_sub(done) > max_age_ms))
        });
        before.saturating_sub(tasks.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegistryTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(Clock::new()))
    }

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            id: Some(id.to_owned()),
            title: "implement parser".to_owned(),
            agent: "executor".to_owned(),
            prompt: "write the parser".to_owned(),
            session_id: "ses_1".to_owned(),
            parent_session_id: Some("ses_parent".to_owned()),
            max_retries: 2,
            timeout_ms: 60_000,
            complexity: Complexity::Low,
        }
    }

    // ── Registration ──

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        let id = registry.register(spec("a3f29c.1")).expect("register");
        assert_eq!(id, "a3f29c.1");

        let task = registry.get(&id).expect("present");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = registry();
        registry.register(spec("a3f29c.1")).expect("register");
        let err = registry.register(spec("a3f29c.1")).expect_err("dup");
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn test_register_generates_id_when_absent() {
        let registry = registry();
        let mut s = spec("unused");
        s.id = None;
        let id = registry.register(s).expect("register");
        assert!(!id.is_empty());
    }

    // ── Status transitions ──

    #[test]
    fn test_update_status_records_result() {
        let registry = registry();
        let id = registry.register(spec("a3f29c.1")).expect("register");
        registry
            .update_status(&id, TaskStatus::Running, None, None)
            .expect("running");
        registry
            .update_status(&id, TaskStatus::Completed, Some("done".to_owned()), None)
            .expect("completed");

        let task = registry.get(&id).expect("present");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_status_sink_mirrors_changes() {
        struct CountingSink(AtomicUsize);
        impl StatusSink for CountingSink {
            fn task_status_changed(
                &self,
                _task_id: &str,
                _status: TaskStatus,
                _result: Option<&str>,
                _error: Option<&str>,
            ) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let registry = TaskRegistry::with_sink(Arc::new(Clock::new()), sink.clone());
        let id = registry.register(spec("a3f29c.1")).expect("register");
        registry
            .update_status(&id, TaskStatus::Running, None, None)
            .expect("running");
        registry
            .update_status(&id, TaskStatus::Failed, None, Some("boom".to_owned()))
            .expect("failed");
        assert_eq!(sink.0.load(Ordering::Relaxed), 2);
    }

    // ── Timeout and stuck detection ──

    #[test]
    fn test_timed_out_tasks() {
        let registry = registry();
        let mut s = spec("a3f29c.1");
        s.timeout_ms = 0;
        let id = registry.register(s).expect("register");
        registry
            .update_status(&id, TaskStatus::Running, None, None)
            .expect("running");

        // timeout_ms of zero: any elapsed time exceeds the budget.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let timed_out = registry.get_timed_out_tasks();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, id);
    }

    #[test]
    fn test_fresh_heartbeat_is_not_stuck() {
        let registry = registry();
        let id = registry.register(spec("a3f29c.1")).expect("register");
        registry
            .update_status(&id, TaskStatus::Running, None, None)
            .expect("running");

        registry.heartbeat(&id).expect("heartbeat");
        assert!(registry.get_stuck_tasks(30_000).is_empty());

        // A zero threshold makes any heartbeat stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(registry.get_stuck_tasks(0).len(), 1);
    }

    #[test]
    fn test_heartbeat_does_not_transition_status() {
        let registry = registry();
        let id = registry.register(spec("a3f29c.1")).expect("register");
        registry.heartbeat(&id).expect("heartbeat");
        assert_eq!(
            registry.get(&id).expect("present").status,
            TaskStatus::Pending
        );
    }

    // ── Retry bookkeeping ──

    #[test]
    fn test_increment_retry_and_session_reissue() {
        let registry = registry();
        let id = registry.register(spec("a3f29c.1")).expect("register");
        assert_eq!(registry.increment_retry(&id).expect("retry"), 1);
        assert_eq!(registry.increment_retry(&id).expect("retry"), 2);

        registry
            .update_session_id(&id, "ses_fresh")
            .expect("reissue");
        let task = registry.get(&id).expect("present");
        assert_eq!(task.session_id, "ses_fresh");
        assert_eq!(task.retry_count, 2);
    }

    // ── Cleanup ──

    #[test]
    fn test_cleanup_drops_only_old_terminal_tasks() {
        let registry = registry();
        let done = registry.register(spec("a3f29c.1")).expect("register");
        let live = registry.register(spec("a3f29c.2")).expect("register");
        registry
            .update_status(&done, TaskStatus::Completed, None, None)
            .expect("complete");
        registry
            .update_status(&live, TaskStatus::Running, None, None)
            .expect("running");

        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = registry.cleanup(0);
        assert_eq!(removed, 1);
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&live).is_some(), "running tasks survive cleanup");
    }

    #[test]
    fn test_get_tasks_by_status() {
        let registry = registry();
        registry.register(spec("a3f29c.1")).expect("register");
        let running = registry.register(spec("a3f29c.2")).expect("register");
        registry
            .update_status(&running, TaskStatus::Running, None, None)
            .expect("running");

        assert_eq!(registry.get_tasks_by_status(TaskStatus::Pending).len(), 1);
        assert_eq!(registry.get_tasks_by_status(TaskStatus::Running).len(), 1);
        assert!(registry.get_tasks_by_status(TaskStatus::Failed).is_empty());
    }
}
