//! Adaptive task supervisor.
//!
//! A background watchdog that reconciles the registry with the agent
//! runtime: times out overdue tasks, probes stuck ones, harvests results
//! from idle sessions, retries within budget with a fresh session, and
//! sweeps expired checkpoints. Passes never overlap; the next pass is
//! scheduled only after the previous one finished, and the poll interval
//! adapts to the complexity of what is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::kernel::buffers::{PromptBuffer, SignalBuffer};
use crate::kernel::registry::{RegistryTask, TaskRegistry};
use crate::kernel::stream::{EventDraft, EventStream};
use crate::ledger::LedgerStore;
use crate::runtime::{latest_assistant_text, CreateSessionRequest, RuntimeClient, SessionState};
use crate::types::{Complexity, EventType, LearningKind, TaskStatus};

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Poll interval when only low-complexity tasks run.
    pub base_interval_ms: u64,
    /// Poll interval when idle or supervising high-complexity tasks.
    pub max_interval_ms: u64,
    /// Heartbeat staleness that classifies a task as stuck.
    pub stuck_threshold_ms: i64,
    /// Age at which terminal tasks leave the registry.
    pub cleanup_ttl_ms: i64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 30_000,
            max_interval_ms: 120_000,
            stuck_threshold_ms: 30_000,
            cleanup_ttl_ms: 3_600_000,
        }
    }
}

/// What one supervision pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Timed-out tasks that got a retry.
    pub retried: usize,
    /// Tasks that exhausted their retry budget this pass.
    pub exhausted: usize,
    /// Results fetched from idle sessions.
    pub results_fetched: usize,
    /// Deferred prompts delivered to idle sessions.
    pub prompts_delivered: usize,
    /// Terminal tasks removed from the registry.
    pub cleaned_up: usize,
    /// Checkpoints auto-expired.
    pub checkpoints_expired: usize,
}

/// The background watchdog.
pub struct TaskSupervisor {
    config: SupervisorConfig,
    registry: Arc<TaskRegistry>,
    client: Arc<dyn RuntimeClient>,
    stream: Arc<EventStream>,
    ledger: Option<Arc<LedgerStore>>,
    signals: Arc<SignalBuffer>,
    prompts: Arc<PromptBuffer>,
    stopped: AtomicBool,
    wake: Notify,
    pass_lock: tokio::sync::Mutex<()>,
}

impl TaskSupervisor {
    /// Assemble a supervisor over its collaborators.
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<TaskRegistry>,
        client: Arc<dyn RuntimeClient>,
        stream: Arc<EventStream>,
        signals: Arc<SignalBuffer>,
        prompts: Arc<PromptBuffer>,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            stream,
            ledger: None,
            signals,
            prompts,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record retry-exhaustion learnings into this ledger.
    pub fn with_ledger(mut self, ledger: Arc<LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Run the watchdog loop until [`TaskSupervisor::stop`].
    ///
    /// Each iteration runs one pass, then sleeps for the adaptive
    /// interval. `stop` interrupts the sleep; an in-flight pass always
    /// finishes.
    pub async fn run(self: Arc<Self>) {
        info!("supervisor started");
        while !self.stopped.load(Ordering::Relaxed) {
            self.check_now().await;
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            let interval = Duration::from_millis(self.next_interval_ms());
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.wake.notified() => {}
            }
        }
        info!("supervisor stopped");
    }

    /// Request shutdown. Idempotent; the pending timer is cancelled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    /// Run a single pass immediately. Passes are mutually exclusive.
    pub async fn check_now(&self) -> PassReport {
        let _guard = self.pass_lock.lock().await;
        let mut report = PassReport::default();

        // Expired checkpoints auto-reject on every pass.
        match self.stream.expire_checkpoints() {
            Ok(expired) => report.checkpoints_expired = expired.len(),
            Err(e) => warn!(error = %e, "checkpoint expiry sweep failed"),
        }

        // 1. Timed-out tasks: retry within budget, otherwise give up.
        for task in self.registry.get_timed_out_tasks() {
            if task.retry_count < task.max_retries {
                self.retry_task(&task).await;
                report.retried = report.retried.saturating_add(1);
            } else {
                self.exhaust(&task, TaskStatus::Timeout, "timed out").await;
                report.exhausted = report.exhausted.saturating_add(1);
            }
        }

        // Session states drive the stuck and completion paths. A status
        // failure skips them for this pass rather than guessing.
        let session_states = match self.client.status().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "runtime status unavailable, skipping idle probes");
                report.cleaned_up = self.registry.cleanup(self.config.cleanup_ttl_ms);
                return report;
            }
        };
        let is_idle = |session_id: &str| {
            session_states.get(session_id) == Some(&SessionState::Idle)
        };

        // 2. Stuck tasks: an idle session means the work actually
        // finished and the heartbeat just stopped; fetch the result.
        for task in self.registry.get_stuck_tasks(self.config.stuck_threshold_ms) {
            if self.registry.get(&task.id).map(|t| t.status) != Some(TaskStatus::Running) {
                continue;
            }
            if is_idle(&task.session_id) {
                if self.fetch_result(&task).await {
                    report.results_fetched = report.results_fetched.saturating_add(1);
                }
            } else if task.retry_count < task.max_retries {
                debug!(task_id = %task.id, "stuck task still busy, retrying");
                self.retry_task(&task).await;
                report.retried = report.retried.saturating_add(1);
            } else {
                self.exhaust(&task, TaskStatus::Failed, "stuck with stale heartbeat")
                    .await;
                report.exhausted = report.exhausted.saturating_add(1);
            }
        }

        // 3. Running tasks whose session went idle are done.
        for task in self.registry.get_tasks_by_status(TaskStatus::Running) {
            if is_idle(&task.session_id) && self.fetch_result(&task).await {
                report.results_fetched = report.results_fetched.saturating_add(1);
            }
        }

        // 4. Deferred prompts go out once their target is idle.
        for (session_id, state) in &session_states {
            if state != &SessionState::Idle || !self.prompts.has_prompts(session_id) {
                continue;
            }
            report.prompts_delivered = report
                .prompts_delivered
                .saturating_add(self.deliver_prompts(session_id).await);
        }

        // 5. Registry hygiene.
        report.cleaned_up = self.registry.cleanup(self.config.cleanup_ttl_ms);
        report
    }

    /// Drain a session's deferred prompts into the runtime.
    ///
    /// A failed delivery re-queues that prompt and everything behind it,
    /// preserving order for the next pass.
    async fn deliver_prompts(&self, session_id: &str) -> usize {
        let mut drained = self.prompts.flush(session_id).into_iter();
        let mut delivered = 0usize;
        while let Some(prompt) = drained.next() {
            match self
                .client
                .prompt(session_id, &prompt.agent, &prompt.prompt)
                .await
            {
                Ok(()) => {
                    debug!(session_id, prompt_id = %prompt.id, "deferred prompt delivered");
                    delivered = delivered.saturating_add(1);
                }
                Err(e) => {
                    warn!(session_id, error = %e, "deferred prompt delivery failed");
                    let mut rest = vec![prompt];
                    rest.extend(drained);
                    self.prompts.requeue_front(session_id, rest);
                    break;
                }
            }
        }
        delivered
    }

    /// Adaptive interval: idle or any high-complexity task → max; any
    /// medium → midpoint; otherwise base.
    pub fn next_interval_ms(&self) -> u64 {
        let running = self.registry.get_tasks_by_status(TaskStatus::Running);
        if running.is_empty() || running.iter().any(|t| t.complexity == Complexity::High) {
            return self.config.max_interval_ms;
        }
        if running.iter().any(|t| t.complexity == Complexity::Medium) {
            return self
                .config
                .base_interval_ms
                .saturating_add(self.config.max_interval_ms)
                / 2;
        }
        self.config.base_interval_ms
    }

    // ── Operator surface ──

    /// Force an immediate retry of one task (the `task_retry` tool).
    ///
    /// Returns false when the task is unknown. The task ends up running
    /// in a fresh session unless the runtime refused, in which case it is
    /// failed like any other retry casualty.
    pub async fn retry_now(&self, task_id: &str) -> bool {
        let Some(task) = self.registry.get(task_id) else {
            return false;
        };
        self.retry_task(&task).await;
        if let Some(task) = self.registry.get(task_id) {
            if task.status != TaskStatus::Failed {
                if let Err(e) = self
                    .registry
                    .update_status(task_id, TaskStatus::Running, None, None)
                {
                    warn!(task_id, error = %e, "retry status bookkeeping failed");
                }
            }
        }
        true
    }

    /// Kill a task (the `task_kill` tool): terminal failure, buffers
    /// cleared. Returns false when the task is unknown.
    pub async fn kill(&self, task_id: &str, reason: &str) -> bool {
        let Some(task) = self.registry.get(task_id) else {
            return false;
        };
        self.mark_failed(&task, reason).await;
        self.cleanup_session(&task.session_id);
        true
    }

    // ── Retry ──

    /// Reissue a task into a fresh session with the original prompt.
    ///
    /// Any runtime failure during create or prompt marks the task failed.
    async fn retry_task(&self, task: &RegistryTask) {
        let retry_count = match self.registry.increment_retry(&task.id) {
            Ok(count) => count,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "retry bookkeeping failed");
                return;
            }
        };

        let created = self
            .client
            .create_session(CreateSessionRequest {
                parent_id: task.parent_session_id.clone(),
                title: format!("retry {retry_count}: {}", task.title),
            })
            .await;
        let new_session = match created {
            Ok(id) => id,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "retry session creation failed");
                self.mark_failed(task, &format!("session creation failed: {e}"))
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .client
            .prompt(&new_session, &task.agent, &task.prompt)
            .await
        {
            warn!(task_id = %task.id, error = %e, "retry prompt failed");
            self.mark_failed(task, &format!("prompt failed: {e}")).await;
            return;
        }

        if let Err(e) = self.registry.update_session_id(&task.id, &new_session) {
            warn!(task_id = %task.id, error = %e, "session reissue bookkeeping failed");
            return;
        }

        info!(
            task_id = %task.id,
            retry = retry_count,
            session_id = %new_session,
            "task retried in fresh session"
        );
        self.emit(EventDraft {
            event_type: Some(EventType::AgentSpawned),
            session_id: new_session,
            actor: "supervisor".to_owned(),
            payload: serde_json::json!({
                "agent": task.agent,
                "taskId": task.id,
            }),
            target_agent: Some(task.agent.clone()),
            retry_count: Some(retry_count),
            ..EventDraft::default()
        });
    }

    // ── Completion ──

    /// Harvest the result of an idle session. Returns whether the task
    /// transitioned to completed.
    async fn fetch_result(&self, task: &RegistryTask) -> bool {
        let messages = match self.client.messages(&task.session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "result fetch failed");
                if task.retry_count < task.max_retries {
                    self.retry_task(task).await;
                } else {
                    self.exhaust(task, TaskStatus::Failed, "result fetch failed")
                        .await;
                }
                return false;
            }
        };

        // Empty histories still complete; the agent may simply have had
        // nothing to say.
        let result = latest_assistant_text(&messages).unwrap_or_default();
        if let Err(e) =
            self.registry
                .update_status(&task.id, TaskStatus::Completed, Some(result.clone()), None)
        {
            warn!(task_id = %task.id, error = %e, "completion bookkeeping failed");
            return false;
        }

        let duration = self
            .registry
            .get(&task.id)
            .and_then(|t| match (t.started_at, t.completed_at) {
                (Some(start), Some(end)) => u64::try_from(end.saturating_sub(start)).ok(),
                _ => None,
            });
        info!(task_id = %task.id, "task completed");
        self.emit(EventDraft {
            event_type: Some(EventType::AgentCompleted),
            session_id: task.session_id.clone(),
            actor: task.agent.clone(),
            payload: serde_json::json!({
                "taskId": task.id,
                "result": result,
            }),
            duration,
            retry_count: (task.retry_count > 0).then_some(task.retry_count),
            ..EventDraft::default()
        });
        true
    }

    // ── Failure ──

    /// Terminal failure after the retry budget is gone: set the final
    /// status, record an anti-pattern learning, and clean up the
    /// session's buffers.
    async fn exhaust(&self, task: &RegistryTask, status: TaskStatus, why: &str) {
        if let Err(e) = self.registry.update_status(
            &task.id,
            status,
            None,
            Some(format!("{why} after {} retries", task.retry_count)),
        ) {
            warn!(task_id = %task.id, error = %e, "exhaustion bookkeeping failed");
        }

        if let Some(ledger) = &self.ledger {
            let content = format!(
                "[Supervisor] Task {} ({}) {why} after {} retries",
                task.id, task.title, task.retry_count
            );
            if let Err(e) = ledger.add_learning(LearningKind::AntiPattern, &content) {
                warn!(task_id = %task.id, error = %e, "learning record failed");
            }
        }

        self.cleanup_session(&task.session_id);
        warn!(task_id = %task.id, why, "task gave up");
        self.emit(EventDraft {
            event_type: Some(EventType::AgentFailed),
            session_id: task.session_id.clone(),
            actor: task.agent.clone(),
            payload: serde_json::json!({
                "taskId": task.id,
                "error": why,
            }),
            retry_count: Some(task.retry_count),
            ..EventDraft::default()
        });
    }

    /// Plain failure (retry machinery itself broke).
    async fn mark_failed(&self, task: &RegistryTask, error: &str) {
        if let Err(e) =
            self.registry
                .update_status(&task.id, TaskStatus::Failed, None, Some(error.to_owned()))
        {
            warn!(task_id = %task.id, error = %e, "failure bookkeeping failed");
        }
        self.emit(EventDraft {
            event_type: Some(EventType::AgentFailed),
            session_id: task.session_id.clone(),
            actor: task.agent.clone(),
            payload: serde_json::json!({
                "taskId": task.id,
                "error": error,
            }),
            ..EventDraft::default()
        });
    }

    /// Drop buffered signals and prompts for a dead session.
    fn cleanup_session(&self, session_id: &str) {
        let dropped_signals = self.signals.flush(session_id).len();
        let dropped_prompts = self.prompts.flush(session_id).len();
        if dropped_signals > 0 || dropped_prompts > 0 {
            debug!(
                session_id,
                dropped_signals, dropped_prompts, "cleared buffers for dead session"
            );
        }
    }

    fn emit(&self, draft: EventDraft) {
        if let Err(e) = self.stream.append(draft) {
            warn!(error = %e, "supervisor event emission failed");
        }
    }
}
