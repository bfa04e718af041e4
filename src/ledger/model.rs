//! Ledger domain model: epics, their tasks, handoffs, and the compact
//! index that points at them.
//!
//! An epic owns at most [`MAX_TASKS_PER_EPIC`] tasks with dense ids
//! `<epic>.<n>`. The index (`LEDGER.md`) is a compact markdown pointer;
//! the full epic lives in `epics/<id>/metadata.json` next to its plan and
//! log files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::{LearningKind, Outcome, Phase, TaskStatus};

/// Hard cap on tasks per epic.
pub const MAX_TASKS_PER_EPIC: usize = 3;

/// Archive ring length in the compact index.
pub const MAX_ARCHIVE_ENTRIES: usize = 5;

/// Recent-learnings window in the compact index.
pub const MAX_RECENT_LEARNINGS: usize = 5;

/// Index format version.
pub const LEDGER_VERSION: u32 = 6;

/// Epic lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    /// Captured but not yet planned.
    Draft,
    /// Being decomposed into tasks.
    Planning,
    /// Tasks are executing.
    InProgress,
    /// Results under review.
    Review,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Execution suspended.
    Paused,
}

impl EpicStatus {
    /// Lower-snake rendering used in ledger files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Parse the ledger rendering.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "planning" => Some(Self::Planning),
            "in_progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    /// Whether work on this epic is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The index phase an epic in this status puts the session in.
    pub fn phase(self) -> Phase {
        match self {
            Self::Draft => Phase::Clarify,
            Self::Planning => Phase::Plan,
            Self::InProgress | Self::Paused => Phase::Execute,
            Self::Review => Phase::Review,
            Self::Completed | Self::Failed => Phase::Complete,
        }
    }
}

/// An agent-executed step within an epic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicTask {
    /// `<epicId>.<n>`, n dense from 1.
    pub id: String,
    /// Short task title.
    pub title: String,
    /// Agent responsible for the task.
    pub agent: String,
    /// Ids of tasks that must finish first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Final output once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome derived from the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// One unit of user-requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    /// Six-hex identifier.
    pub id: String,
    /// Short title.
    pub title: String,
    /// The originating user request, verbatim.
    pub request: String,
    /// Lifecycle status.
    pub status: EpicStatus,
    /// Child tasks, at most [`MAX_TASKS_PER_EPIC`].
    #[serde(default)]
    pub tasks: Vec<EpicTask>,
    /// Free-form context notes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the epic reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Final outcome, set at archive or completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl Epic {
    /// Next dense task id, or `None` when the epic is full.
    pub fn next_task_id(&self) -> Option<String> {
        if self.tasks.len() >= MAX_TASKS_PER_EPIC {
            return None;
        }
        Some(format!("{}.{}", self.id, self.tasks.len().saturating_add(1)))
    }

    /// `"<completed>/<total>"` for the index meta.
    pub fn tasks_completed(&self) -> String {
        let done = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        format!("{done}/{}", self.tasks.len())
    }

    /// Outcome from task states: all completed → SUCCEEDED, some →
    /// PARTIAL, none → FAILED.
    pub fn derive_outcome(&self) -> Outcome {
        let done = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        if !self.tasks.is_empty() && done == self.tasks.len() {
            Outcome::Succeeded
        } else if done > 0 {
            Outcome::Partial
        } else {
            Outcome::Failed
        }
    }
}

/// Status → outcome mapping applied when a task reaches terminal state.
pub fn task_outcome(status: TaskStatus) -> Option<Outcome> {
    match status {
        TaskStatus::Completed => Some(Outcome::Succeeded),
        TaskStatus::Failed | TaskStatus::Timeout => Some(Outcome::Failed),
        TaskStatus::Pending | TaskStatus::Running => None,
    }
}

/// Whether the task dependency graph contains a directed cycle.
///
/// DFS with a recursion stack over task ids; edges point from a task to
/// its dependencies. Dependencies naming unknown tasks are ignored.
pub fn has_circular_dependencies(tasks: &[EpicTask]) -> bool {
    fn visit<'a>(
        id: &'a str,
        tasks: &'a [EpicTask],
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        if stack.contains(id) {
            return true;
        }
        if visited.contains(id) {
            return false;
        }
        visited.insert(id);
        stack.insert(id);
        if let Some(task) = tasks.iter().find(|t| t.id == id) {
            for dep in &task.dependencies {
                if visit(dep, tasks, visited, stack) {
                    return true;
                }
            }
        }
        stack.remove(id);
        false
    }

    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    tasks
        .iter()
        .any(|t| visit(&t.id, tasks, &mut visited, &mut stack))
}

/// Why a session handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    /// The model context filled up.
    ContextLimit,
    /// The user ended the session.
    UserExit,
    /// The session broke unexpectedly.
    SessionBreak,
}

impl HandoffReason {
    /// Lower-snake rendering used in ledger files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContextLimit => "context_limit",
            Self::UserExit => "user_exit",
            Self::SessionBreak => "session_break",
        }
    }

    /// Parse the ledger rendering.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "context_limit" => Some(Self::ContextLimit),
            "user_exit" => Some(Self::UserExit),
            "session_break" => Some(Self::SessionBreak),
            _ => None,
        }
    }
}

/// A persisted record letting a later session pick up the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    /// Why the session stopped.
    pub reason: HandoffReason,
    /// Command that resumes the work.
    pub resume_command: String,
    /// One-paragraph summary of where things stand.
    pub summary: String,
    /// Files touched so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    /// What is already done.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whats_done: Vec<String>,
    /// What comes next.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whats_next: Vec<String>,
    /// Facts the next session must know.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_context: Vec<String>,
}

/// Pointer to the active epic in the compact index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicRef {
    /// Epic id.
    pub id: String,
    /// Epic title.
    pub title: String,
    /// Epic status at last index write.
    pub status: EpicStatus,
}

/// One line of the archive ring in the compact index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    /// Archived epic id.
    pub epic_id: String,
    /// Epic title.
    pub title: String,
    /// Final outcome.
    pub outcome: Outcome,
    /// When it was archived.
    pub archived_at: DateTime<Utc>,
}

/// A learning as surfaced in the compact index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentLearning {
    /// Learning kind.
    pub kind: LearningKind,
    /// Learned content, single line.
    pub content: String,
}

/// Index metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMeta {
    /// Index format version.
    pub version: u32,
    /// Session that last wrote the index.
    pub session_id: String,
    /// Current orchestration phase.
    pub phase: Phase,
    /// Last index write time.
    pub last_updated: DateTime<Utc>,
    /// Free status marker, e.g. `"handoff"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// `"<done>/<total>"` for the active epic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_completed: Option<String>,
    /// Serialized workflow engine state, when a workflow is paused or
    /// mid-flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workflow: Option<serde_json::Value>,
}

/// The compact markdown-rendered index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerIndex {
    /// Metadata block.
    pub meta: LedgerMeta,
    /// Active epic pointer, if one is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_epic: Option<EpicRef>,
    /// Most recent learnings, newest first, at most five.
    #[serde(default)]
    pub recent_learnings: Vec<RecentLearning>,
    /// Active handoff record, at most one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Handoff>,
    /// Archive ring, newest first, at most five.
    #[serde(default)]
    pub archive: Vec<ArchiveEntry>,
}

impl LedgerIndex {
    /// A fresh index for a session, phase CLARIFY, nothing active.
    pub fn fresh(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            meta: LedgerMeta {
                version: LEDGER_VERSION,
                session_id: session_id.to_owned(),
                phase: Phase::Clarify,
                last_updated: now,
                status: None,
                tasks_completed: None,
                active_workflow: None,
            },
            active_epic: None,
            recent_learnings: Vec::new(),
            handoff: None,
            archive: Vec::new(),
        }
    }
}
