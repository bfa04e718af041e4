//! File-backed ledger store.
//!
//! Every operation is a serialized read-parse-mutate-render-write cycle
//! over the compact index (`LEDGER.md`) and the active epic's files
//! (`epics/<id>/{metadata.json, spec.md, plan.md, log.md}`). Writes are
//! atomic (temp file + rename) and guarded by an advisory lock file so a
//! second process never observes a half-written ledger.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kernel::bridge::LedgerEventBridge;
use crate::kernel::ids;
use crate::kernel::registry::StatusSink;
use crate::ledger::markdown::{self, MarkdownError};
use crate::ledger::model::{
    has_circular_dependencies, task_outcome, ArchiveEntry, Epic, EpicRef, EpicStatus, EpicTask,
    Handoff, HandoffReason, LedgerIndex, RecentLearning, MAX_ARCHIVE_ENTRIES,
    MAX_RECENT_LEARNINGS, MAX_TASKS_PER_EPIC,
};
use crate::types::{EventType, LearningKind, Outcome, TaskStatus};

/// Index file name inside the base directory.
const INDEX_FILE: &str = "LEDGER.md";

/// Lock acquisition attempts before giving up.
const LOCK_RETRIES: u32 = 5;

/// Delay between lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(40);

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure.
    #[error("ledger io error at {path}: {source}")]
    Io {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Index markdown failure.
    #[error(transparent)]
    Markdown(#[from] MarkdownError),
    /// Epic metadata (de)serialization failure.
    #[error("epic metadata error: {0}")]
    Json(#[from] serde_json::Error),
    /// A precondition was violated; nothing was mutated.
    #[error("{0}")]
    StateViolation(String),
    /// The referenced epic or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The advisory lock stayed contended.
    #[error("could not lock ledger at {path}")]
    LockContended {
        /// Lock file path.
        path: PathBuf,
    },
}

/// A learning as stored in the bucket files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLearning {
    /// Learning kind.
    pub kind: LearningKind,
    /// Learned content.
    pub content: String,
}

/// Summary returned by [`LedgerStore::status`].
#[derive(Debug, Clone)]
pub struct LedgerStatus {
    /// The compact index.
    pub index: LedgerIndex,
    /// Full active epic, when one is open.
    pub epic: Option<Epic>,
}

/// The file-backed ledger store.
///
/// One instance per ledger path; operations are serialized through an
/// internal mutex and an advisory lock file for other processes.
pub struct LedgerStore {
    base_dir: PathBuf,
    session_id: String,
    bridge: Option<Arc<LedgerEventBridge>>,
    op_lock: Mutex<()>,
}

impl LedgerStore {
    /// Create a store rooted at `base_dir` (the `.opencode` directory).
    pub fn new(base_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            session_id: session_id.into(),
            bridge: None,
            op_lock: Mutex::new(()),
        }
    }

    /// Attach the event bridge; subsequent mutations emit `ledger.*`
    /// events.
    pub fn with_bridge(mut self, bridge: Arc<LedgerEventBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Ensure the directory tree and a parseable index exist.
    pub fn initialize(&self) -> Result<(), LedgerError> {
        let _guard = self.lock_ops();
        for dir in ["epics", "learnings", "archive", "context"] {
            let path = self.base_dir.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| LedgerError::Io { path, source: e })?;
        }
        if !self.index_path().exists() {
            let index = LedgerIndex::fresh(&self.session_id, Utc::now());
            self.write_index(&index)?;
            info!(path = %self.index_path().display(), "created fresh ledger index");
        }
        Ok(())
    }

    /// Current index plus the full active epic.
    pub fn status(&self) -> Result<LedgerStatus, LedgerError> {
        let _guard = self.lock_ops();
        let index = self.read_index()?;
        let epic = match &index.active_epic {
            Some(epic_ref) => Some(self.read_epic(&epic_ref.id)?),
            None => None,
        };
        Ok(LedgerStatus { index, epic })
    }

    // ── Epic lifecycle ──

    /// Open a new epic. Fails while another epic is active.
    pub fn create_epic(&self, title: &str, request: &str) -> Result<Epic, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;

        if let Some(active) = &index.active_epic {
            if !active.status.is_terminal() {
                return Err(LedgerError::StateViolation(format!(
                    "Cannot create epic: epic {} ({}) is still active. Archive it first.",
                    active.id, active.title
                )));
            }
        }

        let now = Utc::now();
        let epic = Epic {
            id: ids::epic_id(),
            title: title.to_owned(),
            request: request.to_owned(),
            status: EpicStatus::Draft,
            tasks: Vec::new(),
            context: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            outcome: None,
        };

        let epic_dir = self.epic_dir(&epic.id);
        std::fs::create_dir_all(&epic_dir).map_err(|e| LedgerError::Io {
            path: epic_dir.clone(),
            source: e,
        })?;
        self.write_epic(&epic)?;
        self.write_atomic(
            &epic_dir.join("spec.md"),
            &format!("# {title}\n\n{request}\n"),
        )?;
        self.write_atomic(&epic_dir.join("plan.md"), &format!("# Plan: {title}\n\n"))?;
        self.write_atomic(&epic_dir.join("log.md"), &format!("# Log: {title}\n\n"))?;

        index.active_epic = Some(EpicRef {
            id: epic.id.clone(),
            title: epic.title.clone(),
            status: epic.status,
        });
        index.meta.phase = epic.status.phase();
        index.meta.tasks_completed = Some("0/0".to_owned());
        self.write_index(&index)?;

        info!(epic_id = %epic.id, title, "epic created");
        self.emit(
            EventType::LedgerEpicCreated,
            serde_json::json!({ "epicId": epic.id, "title": epic.title }),
        );
        Ok(epic)
    }

    /// Move the active epic to a new status, updating the index phase.
    pub fn update_epic_status(&self, status: EpicStatus) -> Result<Epic, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        let epic_ref = index
            .active_epic
            .as_mut()
            .ok_or_else(|| LedgerError::StateViolation("no active epic".to_owned()))?;

        let mut epic = self.read_epic(&epic_ref.id)?;
        epic.status = status;
        epic.updated_at = Utc::now();
        if status.is_terminal() {
            epic.completed_at = Some(epic.updated_at);
        }
        self.write_epic(&epic)?;

        epic_ref.status = status;
        index.meta.phase = status.phase();
        self.write_index(&index)?;

        let event_type = match status {
            EpicStatus::InProgress => Some(EventType::LedgerEpicStarted),
            EpicStatus::Completed => Some(EventType::LedgerEpicCompleted),
            EpicStatus::Failed => Some(EventType::LedgerEpicFailed),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.emit(
                event_type,
                serde_json::json!({ "epicId": epic.id, "status": epic.status.as_str() }),
            );
        }
        Ok(epic)
    }

    /// Close the active epic into the archive ring and directory.
    ///
    /// Derives the outcome from task states when none is given.
    pub fn archive_epic(&self, outcome: Option<Outcome>) -> Result<Epic, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        let epic_ref = index
            .active_epic
            .clone()
            .ok_or_else(|| LedgerError::StateViolation("no active epic to archive".to_owned()))?;

        let mut epic = self.read_epic(&epic_ref.id)?;
        let outcome = outcome.unwrap_or_else(|| epic.derive_outcome());
        epic.outcome = Some(outcome);
        epic.status = match outcome {
            Outcome::Succeeded => EpicStatus::Completed,
            Outcome::Partial | Outcome::Failed => EpicStatus::Failed,
        };
        epic.completed_at = Some(Utc::now());
        epic.updated_at = epic.completed_at.unwrap_or_else(Utc::now);
        self.write_epic(&epic)?;

        // Move the epic directory into long-term archive.
        let from = self.epic_dir(&epic.id);
        let to = self.base_dir.join("archive").join(&epic.id);
        std::fs::rename(&from, &to).map_err(|e| LedgerError::Io {
            path: from.clone(),
            source: e,
        })?;

        index.archive.insert(
            0,
            ArchiveEntry {
                epic_id: epic.id.clone(),
                title: epic.title.clone(),
                outcome,
                archived_at: epic.completed_at.unwrap_or_else(Utc::now),
            },
        );
        index.archive.truncate(MAX_ARCHIVE_ENTRIES);
        index.active_epic = None;
        index.meta.phase = crate::types::Phase::Clarify;
        index.meta.tasks_completed = None;
        self.write_index(&index)?;

        info!(epic_id = %epic.id, outcome = outcome.as_str(), "epic archived");
        self.emit(
            EventType::LedgerEpicArchived,
            serde_json::json!({ "epicId": epic.id, "outcome": outcome.as_str() }),
        );
        Ok(epic)
    }

    // ── Tasks ──

    /// Add a task to the active epic.
    ///
    /// Rejects a fourth task, dependencies on unknown tasks, and
    /// dependency cycles. The new id is `<epic>.<n+1>`.
    pub fn create_task(
        &self,
        title: &str,
        agent: &str,
        dependencies: Vec<String>,
    ) -> Result<EpicTask, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        let epic_ref = index
            .active_epic
            .clone()
            .ok_or_else(|| LedgerError::StateViolation("no active epic".to_owned()))?;

        let mut epic = self.read_epic(&epic_ref.id)?;
        let Some(task_id) = epic.next_task_id() else {
            return Err(LedgerError::StateViolation(format!(
                "Cannot create task: epic {} already has {MAX_TASKS_PER_EPIC} tasks.",
                epic.id
            )));
        };

        for dep in &dependencies {
            if !epic.tasks.iter().any(|t| &t.id == dep) {
                return Err(LedgerError::StateViolation(format!(
                    "Cannot create task: dependency {dep} does not exist."
                )));
            }
        }

        let task = EpicTask {
            id: task_id,
            title: title.to_owned(),
            agent: agent.to_owned(),
            dependencies,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            outcome: None,
        };

        let mut candidate = epic.tasks.clone();
        candidate.push(task.clone());
        if has_circular_dependencies(&candidate) {
            return Err(LedgerError::StateViolation(
                "Cannot create task: dependencies would form a cycle.".to_owned(),
            ));
        }

        epic.tasks = candidate;
        if epic.status == EpicStatus::Draft {
            epic.status = EpicStatus::Planning;
        }
        epic.updated_at = Utc::now();
        self.write_epic(&epic)?;

        self.append_plan_line(&epic, &task)?;
        if let Some(epic_ref) = index.active_epic.as_mut() {
            epic_ref.status = epic.status;
        }
        index.meta.phase = epic.status.phase();
        index.meta.tasks_completed = Some(epic.tasks_completed());
        self.write_index(&index)?;

        debug!(task_id = %task.id, agent, "task created");
        self.emit(
            EventType::LedgerTaskCreated,
            serde_json::json!({ "taskId": task.id, "agent": task.agent }),
        );
        Ok(task)
    }

    /// Update a task's status, applying the status → outcome mapping and
    /// refreshing plan markers plus the index counter.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<EpicTask, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        let epic_ref = index
            .active_epic
            .clone()
            .ok_or_else(|| LedgerError::StateViolation("no active epic".to_owned()))?;

        let mut epic = self.read_epic(&epic_ref.id)?;
        let now = Utc::now();
        let task = epic
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;

        task.status = status;
        task.outcome = task_outcome(status);
        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        if let Some(result) = result {
            task.result = Some(result);
        }
        if let Some(error) = error {
            task.error = Some(error);
        }
        let task = task.clone();

        if status == TaskStatus::Running
            && matches!(epic.status, EpicStatus::Draft | EpicStatus::Planning)
        {
            epic.status = EpicStatus::InProgress;
        }
        epic.updated_at = now;
        self.write_epic(&epic)?;
        self.update_task_in_plan(&epic.id, task_id, status)?;

        if let Some(epic_ref) = index.active_epic.as_mut() {
            epic_ref.status = epic.status;
        }
        index.meta.phase = epic.status.phase();
        index.meta.tasks_completed = Some(epic.tasks_completed());
        self.write_index(&index)?;

        let event_type = match status {
            TaskStatus::Running => Some(EventType::LedgerTaskStarted),
            TaskStatus::Completed => Some(EventType::LedgerTaskCompleted),
            TaskStatus::Failed | TaskStatus::Timeout => Some(EventType::LedgerTaskFailed),
            TaskStatus::Pending => None,
        };
        if let Some(event_type) = event_type {
            self.emit(
                event_type,
                serde_json::json!({ "taskId": task_id, "status": status }),
            );
        }
        Ok(task)
    }

    /// Rewrite a task's plan marker and recount the summary.
    ///
    /// `[ ]` stays for unfinished work, `[x]` marks completion, `[!]`
    /// marks failure or timeout. Returns `(completed, total)` counted
    /// from the rewritten file.
    pub fn update_task_in_plan(
        &self,
        epic_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(usize, usize), LedgerError> {
        let plan_path = self.epic_dir(epic_id).join("plan.md");
        let body = std::fs::read_to_string(&plan_path).map_err(|e| LedgerError::Io {
            path: plan_path.clone(),
            source: e,
        })?;

        let marker = match status {
            TaskStatus::Completed => "[x]",
            TaskStatus::Failed | TaskStatus::Timeout => "[!]",
            TaskStatus::Pending | TaskStatus::Running => "[ ]",
        };
        let line_re = Regex::new(&format!(
            r"(?m)^- \[[ x!]\] Task {}:",
            regex::escape(task_id)
        ))
        .map_err(|e| LedgerError::StateViolation(format!("bad plan marker pattern: {e}")))?;
        let rewritten = line_re
            .replace(&body, format!("- {marker} Task {task_id}:"))
            .into_owned();
        self.write_atomic(&plan_path, &rewritten)?;

        let total_re = Regex::new(r"(?m)^- \[[ x!]\] Task ")
            .map_err(|e| LedgerError::StateViolation(format!("bad plan count pattern: {e}")))?;
        let done_re = Regex::new(r"(?m)^- \[x\] Task ")
            .map_err(|e| LedgerError::StateViolation(format!("bad plan count pattern: {e}")))?;
        let total = total_re.find_iter(&rewritten).count();
        let done = done_re.find_iter(&rewritten).count();
        Ok((done, total))
    }

    // ── Learnings ──

    /// Record a learning: bucket file plus the index's recent window.
    pub fn add_learning(&self, kind: LearningKind, content: &str) -> Result<(), LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;

        let path = self.learning_file(kind);
        let mut body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(LedgerError::Io { path, source: e }),
        };
        body.push_str(&format!("- [{}] {}\n", markdown::kind_str(kind), content));
        self.write_atomic(&path, &body)?;

        let mut index = self.read_index()?;
        index.recent_learnings.insert(
            0,
            RecentLearning {
                kind,
                content: content.to_owned(),
            },
        );
        index.recent_learnings.truncate(MAX_RECENT_LEARNINGS);
        self.write_index(&index)?;

        self.emit(
            EventType::LedgerLearningExtracted,
            serde_json::json!({ "kind": kind, "content": content }),
        );
        Ok(())
    }

    /// Learnings from the bucket files, newest first, strictly capped at
    /// `limit`.
    pub fn get_learnings(
        &self,
        kind: Option<LearningKind>,
        limit: usize,
    ) -> Result<Vec<StoredLearning>, LedgerError> {
        let _guard = self.lock_ops();
        let files: Vec<PathBuf> = match kind {
            Some(kind) => vec![self.learning_file(kind)],
            None => ["patterns.md", "decisions.md", "preferences.md"]
                .iter()
                .map(|f| self.base_dir.join("learnings").join(f))
                .collect(),
        };

        let mut out = Vec::new();
        for path in files {
            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LedgerError::Io { path, source: e }),
            };
            for line in body.lines() {
                let Some(rest) = line.strip_prefix("- [") else {
                    continue;
                };
                let Some((kind_tag, content)) = rest.split_once("] ") else {
                    continue;
                };
                let Some(parsed_kind) = markdown::parse_kind(kind_tag) else {
                    continue;
                };
                if kind.is_some_and(|k| k != parsed_kind) {
                    continue;
                }
                out.push(StoredLearning {
                    kind: parsed_kind,
                    content: content.to_owned(),
                });
            }
        }
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    // ── Context ──

    /// Append a free-form note to the active epic's context and log.
    pub fn add_context(&self, note: &str) -> Result<(), LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let index = self.read_index()?;
        let epic_ref = index
            .active_epic
            .as_ref()
            .ok_or_else(|| LedgerError::StateViolation("no active epic".to_owned()))?;

        let mut epic = self.read_epic(&epic_ref.id)?;
        epic.context.push(note.to_owned());
        epic.updated_at = Utc::now();
        self.write_epic(&epic)?;
        self.append_log_line(&epic.id, note)?;
        Ok(())
    }

    // ── Handoff ──

    /// Record a handoff and mark the index status accordingly.
    pub fn create_handoff(&self, handoff: Handoff) -> Result<(), LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        index.handoff = Some(handoff.clone());
        index.meta.status = Some("handoff".to_owned());
        self.write_index(&index)?;

        info!(reason = handoff.reason.as_str(), "handoff created");
        self.emit(
            EventType::LedgerHandoffCreated,
            serde_json::json!({
                "reason": handoff.reason.as_str(),
                "resumeCommand": handoff.resume_command,
            }),
        );
        Ok(())
    }

    /// Consume the active handoff, if any, clearing the status marker.
    pub fn resume_handoff(&self) -> Result<Option<Handoff>, LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        let handoff = index.handoff.take();
        if handoff.is_some() {
            index.meta.status = None;
            self.write_index(&index)?;
            self.emit(EventType::LedgerHandoffResumed, serde_json::json!({}));
        }
        Ok(handoff)
    }

    // ── Workflow state slot ──

    /// Persist workflow engine state into the index meta.
    pub fn set_active_workflow(
        &self,
        state: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let _guard = self.lock_ops();
        let _file_lock = self.acquire_file_lock()?;
        let mut index = self.read_index()?;
        index.meta.active_workflow = state;
        self.write_index(&index)
    }

    /// Stored workflow engine state, if any.
    pub fn active_workflow(&self) -> Result<Option<serde_json::Value>, LedgerError> {
        let _guard = self.lock_ops();
        Ok(self.read_index()?.meta.active_workflow)
    }

    // ── File plumbing ──

    fn index_path(&self) -> PathBuf {
        self.base_dir.join(INDEX_FILE)
    }

    fn epic_dir(&self, epic_id: &str) -> PathBuf {
        self.base_dir.join("epics").join(epic_id)
    }

    fn learning_file(&self, kind: LearningKind) -> PathBuf {
        let name = match kind {
            LearningKind::Pattern | LearningKind::AntiPattern => "patterns.md",
            LearningKind::Decision | LearningKind::Insight => "decisions.md",
            LearningKind::Preference | LearningKind::Correction => "preferences.md",
        };
        self.base_dir.join("learnings").join(name)
    }

    fn read_index(&self) -> Result<LedgerIndex, LedgerError> {
        let path = self.index_path();
        let body = std::fs::read_to_string(&path).map_err(|e| LedgerError::Io {
            path: path.clone(),
            source: e,
        })?;
        let parsed = markdown::parse(&body)?;
        if parsed.warnings > 0 {
            warn!(warnings = parsed.warnings, "ledger index had unrecognized lines");
        }
        Ok(parsed.index)
    }

    fn write_index(&self, index: &LedgerIndex) -> Result<(), LedgerError> {
        let mut index = index.clone();
        index.meta.session_id = self.session_id.clone();
        index.meta.last_updated = Utc::now();
        self.write_atomic(&self.index_path(), &markdown::render(&index))
    }

    fn read_epic(&self, epic_id: &str) -> Result<Epic, LedgerError> {
        let path = self.epic_dir(epic_id).join("metadata.json");
        let body = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LedgerError::NotFound(format!("epic {epic_id}")),
            _ => LedgerError::Io {
                path: path.clone(),
                source: e,
            },
        })?;
        Ok(serde_json::from_str(&body)?)
    }

    fn write_epic(&self, epic: &Epic) -> Result<(), LedgerError> {
        let path = self.epic_dir(&epic.id).join("metadata.json");
        self.write_atomic(&path, &serde_json::to_string_pretty(epic)?)
    }

    fn append_plan_line(&self, epic: &Epic, task: &EpicTask) -> Result<(), LedgerError> {
        let plan_path = self.epic_dir(&epic.id).join("plan.md");
        let mut body = std::fs::read_to_string(&plan_path).map_err(|e| LedgerError::Io {
            path: plan_path.clone(),
            source: e,
        })?;
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (deps: {})", task.dependencies.join(", "))
        };
        body.push_str(&format!(
            "- [ ] Task {}: {} (agent: {}){deps}\n",
            task.id, task.title, task.agent
        ));
        self.write_atomic(&plan_path, &body)
    }

    fn append_log_line(&self, epic_id: &str, message: &str) -> Result<(), LedgerError> {
        let log_path = self.epic_dir(epic_id).join("log.md");
        let mut body = std::fs::read_to_string(&log_path).map_err(|e| LedgerError::Io {
            path: log_path.clone(),
            source: e,
        })?;
        body.push_str(&format!("- {} {}\n", Utc::now().to_rfc3339(), message));
        self.write_atomic(&log_path, &body)
    }

    fn write_atomic(&self, path: &Path, body: &str) -> Result<(), LedgerError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(|e| LedgerError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.emit(event_type, payload, None) {
                warn!(error = %e, "ledger event emission failed");
            }
        }
    }

    fn lock_ops(&self) -> std::sync::MutexGuard<'_, ()> {
        self.op_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire_file_lock(&self) -> Result<FileLockGuard, LedgerError> {
        let lock_path = self.base_dir.join(format!("{INDEX_FILE}.lock"));
        for _ in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(FileLockGuard {
                        path: lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(LedgerError::Io {
                        path: lock_path,
                        source: e,
                    })
                }
            }
        }
        Err(LedgerError::LockContended { path: lock_path })
    }
}

struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove ledger lock");
        }
    }
}

/// Adapter mirroring registry status changes into the ledger.
pub struct LedgerSync {
    store: Arc<LedgerStore>,
}

impl LedgerSync {
    /// Wrap a store for use as a registry sink.
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }
}

impl StatusSink for LedgerSync {
    fn task_status_changed(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) {
        if let Err(e) = self.store.update_task_status(
            task_id,
            status,
            result.map(str::to_owned),
            error.map(str::to_owned),
        ) {
            // Registry tasks without a ledger twin are normal; anything
            // else is worth a warning.
            match e {
                LedgerError::NotFound(_) | LedgerError::StateViolation(_) => {
                    debug!(task_id, error = %e, "ledger sync skipped");
                }
                _ => warn!(task_id, error = %e, "ledger sync failed"),
            }
        }
    }
}

/// Convenience constructor for a handoff record.
pub fn handoff(
    reason: HandoffReason,
    resume_command: &str,
    summary: &str,
) -> Handoff {
    Handoff {
        reason,
        resume_command: resume_command.to_owned(),
        summary: summary.to_owned(),
        files_modified: Vec::new(),
        whats_done: Vec::new(),
        whats_next: Vec::new(),
        key_context: Vec::new(),
    }
}
