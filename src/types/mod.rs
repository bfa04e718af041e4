//! Shared domain types: events, checkpoints, context snapshots, learnings,
//! and the signal/prompt records exchanged between agents.
//!
//! Everything here is wire-visible. Events are serialized one JSON object
//! per line into the orchestration stream; field names follow the stream's
//! established camelCase wire format, so every struct carries a
//! `rename_all` attribute. Unknown wire fields are preserved on parse and
//! re-emitted on replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of event types understood by the core.
///
/// Stored as dotted strings on the wire (`"agent.completed"`). Tags that
/// this build does not know deserialize into [`EventType::Opaque`] so that
/// streams written by newer builds still replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A new agent session was created.
    SessionCreated,
    /// An existing session was resumed after restart.
    SessionResumed,
    /// An agent was spawned to work on a task.
    AgentSpawned,
    /// An agent finished its task successfully.
    AgentCompleted,
    /// An agent failed its task.
    AgentFailed,
    /// A handoff to a later session was initiated.
    HandoffInitiated,
    /// A handoff was picked up and completed.
    HandoffCompleted,
    /// An agent context snapshot was captured.
    ContextSnapshot,
    /// A previously captured context was restored.
    ContextRestored,
    /// A checkpoint is awaiting a human decision.
    CheckpointRequested,
    /// A checkpoint was approved.
    CheckpointApproved,
    /// A checkpoint was rejected.
    CheckpointRejected,
    /// A human intervened outside a checkpoint.
    HumanIntervention,
    /// A human approved an action.
    HumanApproved,
    /// A human rejected an action.
    HumanRejected,
    /// A learning was extracted from the stream.
    LearningExtracted,
    /// The system recovered from an error.
    ErrorRecovered,
    /// Incremental task progress.
    TaskProgress,
    /// Ledger: epic created.
    LedgerEpicCreated,
    /// Ledger: epic moved to in-progress.
    LedgerEpicStarted,
    /// Ledger: epic completed.
    LedgerEpicCompleted,
    /// Ledger: epic failed.
    LedgerEpicFailed,
    /// Ledger: epic archived.
    LedgerEpicArchived,
    /// Ledger: task created.
    LedgerTaskCreated,
    /// Ledger: task started.
    LedgerTaskStarted,
    /// Ledger: task completed.
    LedgerTaskCompleted,
    /// Ledger: task failed.
    LedgerTaskFailed,
    /// Ledger: task yielded awaiting an external decision.
    LedgerTaskYielded,
    /// Ledger: handoff record created.
    LedgerHandoffCreated,
    /// Ledger: handoff resumed.
    LedgerHandoffResumed,
    /// Ledger: governance directive recorded.
    LedgerGovernanceDirectiveAdded,
    /// Ledger: governance assumption recorded.
    LedgerGovernanceAssumptionAdded,
    /// Ledger: learning recorded.
    LedgerLearningExtracted,
    /// Ledger progress: free-form status update.
    LedgerProgressStatusUpdate,
    /// Ledger progress: a phase started.
    LedgerProgressPhaseStarted,
    /// Ledger progress: a phase completed.
    LedgerProgressPhaseCompleted,
    /// Ledger progress: user action needed.
    LedgerProgressUserActionNeeded,
    /// Ledger progress: context handed off.
    LedgerProgressContextHandoff,
    /// Unknown tag preserved verbatim for forward compatibility.
    Opaque(String),
}

impl EventType {
    /// The wire string for this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionResumed => "session.resumed",
            Self::AgentSpawned => "agent.spawned",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::HandoffInitiated => "handoff.initiated",
            Self::HandoffCompleted => "handoff.completed",
            Self::ContextSnapshot => "context.snapshot",
            Self::ContextRestored => "context.restored",
            Self::CheckpointRequested => "checkpoint.requested",
            Self::CheckpointApproved => "checkpoint.approved",
            Self::CheckpointRejected => "checkpoint.rejected",
            Self::HumanIntervention => "human.intervention",
            Self::HumanApproved => "human.approved",
            Self::HumanRejected => "human.rejected",
            Self::LearningExtracted => "learning.extracted",
            Self::ErrorRecovered => "error.recovered",
            Self::TaskProgress => "task.progress",
            Self::LedgerEpicCreated => "ledger.epic.created",
            Self::LedgerEpicStarted => "ledger.epic.started",
            Self::LedgerEpicCompleted => "ledger.epic.completed",
            Self::LedgerEpicFailed => "ledger.epic.failed",
            Self::LedgerEpicArchived => "ledger.epic.archived",
            Self::LedgerTaskCreated => "ledger.task.created",
            Self::LedgerTaskStarted => "ledger.task.started",
            Self::LedgerTaskCompleted => "ledger.task.completed",
            Self::LedgerTaskFailed => "ledger.task.failed",
            Self::LedgerTaskYielded => "ledger.task.yielded",
            Self::LedgerHandoffCreated => "ledger.handoff.created",
            Self::LedgerHandoffResumed => "ledger.handoff.resumed",
            Self::LedgerGovernanceDirectiveAdded => "ledger.governance.directive_added",
            Self::LedgerGovernanceAssumptionAdded => "ledger.governance.assumption_added",
            Self::LedgerLearningExtracted => "ledger.learning.extracted",
            Self::LedgerProgressStatusUpdate => "ledger.progress.status_update",
            Self::LedgerProgressPhaseStarted => "ledger.progress.phase_started",
            Self::LedgerProgressPhaseCompleted => "ledger.progress.phase_completed",
            Self::LedgerProgressUserActionNeeded => "ledger.progress.user_action_needed",
            Self::LedgerProgressContextHandoff => "ledger.progress.context_handoff",
            Self::Opaque(tag) => tag.as_str(),
        }
    }

    /// Parse a wire tag. Unknown tags become [`EventType::Opaque`].
    pub fn parse(tag: &str) -> Self {
        match tag {
            "session.created" => Self::SessionCreated,
            "session.resumed" => Self::SessionResumed,
            "agent.spawned" => Self::AgentSpawned,
            "agent.completed" => Self::AgentCompleted,
            "agent.failed" => Self::AgentFailed,
            "handoff.initiated" => Self::HandoffInitiated,
            "handoff.completed" => Self::HandoffCompleted,
            "context.snapshot" => Self::ContextSnapshot,
            "context.restored" => Self::ContextRestored,
            "checkpoint.requested" => Self::CheckpointRequested,
            "checkpoint.approved" => Self::CheckpointApproved,
            "checkpoint.rejected" => Self::CheckpointRejected,
            "human.intervention" => Self::HumanIntervention,
            "human.approved" => Self::HumanApproved,
            "human.rejected" => Self::HumanRejected,
            "learning.extracted" => Self::LearningExtracted,
            "error.recovered" => Self::ErrorRecovered,
            "task.progress" => Self::TaskProgress,
            "ledger.epic.created" => Self::LedgerEpicCreated,
            "ledger.epic.started" => Self::LedgerEpicStarted,
            "ledger.epic.completed" => Self::LedgerEpicCompleted,
            "ledger.epic.failed" => Self::LedgerEpicFailed,
            "ledger.epic.archived" => Self::LedgerEpicArchived,
            "ledger.task.created" => Self::LedgerTaskCreated,
            "ledger.task.started" => Self::LedgerTaskStarted,
            "ledger.task.completed" => Self::LedgerTaskCompleted,
            "ledger.task.failed" => Self::LedgerTaskFailed,
            "ledger.task.yielded" => Self::LedgerTaskYielded,
            "ledger.handoff.created" => Self::LedgerHandoffCreated,
            "ledger.handoff.resumed" => Self::LedgerHandoffResumed,
            "ledger.governance.directive_added" => Self::LedgerGovernanceDirectiveAdded,
            "ledger.governance.assumption_added" => Self::LedgerGovernanceAssumptionAdded,
            "ledger.learning.extracted" => Self::LedgerLearningExtracted,
            "ledger.progress.status_update" => Self::LedgerProgressStatusUpdate,
            "ledger.progress.phase_started" => Self::LedgerProgressPhaseStarted,
            "ledger.progress.phase_completed" => Self::LedgerProgressPhaseCompleted,
            "ledger.progress.user_action_needed" => Self::LedgerProgressUserActionNeeded,
            "ledger.progress.context_handoff" => Self::LedgerProgressContextHandoff,
            other => Self::Opaque(other.to_owned()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// Event metadata: stream position and routing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Monotonically increasing position within the stream segment.
    pub offset: u64,
    /// Per-process identifier grouping all events of one run.
    pub correlation_id: String,
    /// Agent that produced the event.
    pub source_agent: String,
    /// Agent the event targets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    /// Operation duration in milliseconds, if measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Retry attempt the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Wire fields this build does not know, carried through replay.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One immutable record in the orchestration stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Derived from correlation id + timestamp + offset.
    pub id: String,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Session the event belongs to.
    pub session_id: String,
    /// Causing event, if this one is a consequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    /// Who produced the event (agent name or "user").
    pub actor: String,
    /// Opaque structured payload; schema is frozen per event type.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Stream position and routing context.
    pub metadata: EventMetadata,
    /// Embedded checkpoint for `checkpoint.*` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    /// Unknown top-level wire fields, preserved for replay.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A choice offered at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOption {
    /// Stable option identifier.
    pub id: String,
    /// Short label shown to the human.
    pub label: String,
    /// Longer explanation of the consequence.
    pub description: String,
    /// Action token the workflow dispatches on selection.
    pub action: String,
}

/// Checkpoint lifecycle state. Only `Pending` may transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved by a human.
    Approved,
    /// Rejected by a human.
    Rejected,
    /// Timed out without a decision.
    Expired,
}

/// A decision point awaiting human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub id: String,
    /// What is being decided.
    pub decision_point: String,
    /// The available choices.
    pub options: Vec<CheckpointOption>,
    /// Agent that requested the decision.
    pub requested_by: String,
    /// When the request was made (unix ms).
    pub requested_at: i64,
    /// Who resolved it, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// When it was resolved (unix ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<i64>,
    /// Deadline after which the checkpoint auto-expires (unix ms).
    pub expires_at: i64,
    /// Current lifecycle state.
    pub status: CheckpointStatus,
}

impl Checkpoint {
    /// Whether the checkpoint is still awaiting a decision.
    pub fn is_pending(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }

    /// Whether the deadline has passed for a still-pending checkpoint.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.is_pending() && now_ms > self.expires_at
    }
}

/// Orchestration phase the session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Gathering requirements from the user.
    Clarify,
    /// Decomposing the request into tasks.
    Plan,
    /// Tasks are running.
    Execute,
    /// Results are under review.
    Review,
    /// The epic is done.
    Complete,
}

impl Phase {
    /// The canonical upper-case name used in the ledger index.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clarify => "CLARIFY",
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
            Self::Review => "REVIEW",
            Self::Complete => "COMPLETE",
        }
    }

    /// Parse a phase name as rendered in the ledger index.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLARIFY" => Some(Self::Clarify),
            "PLAN" => Some(Self::Plan),
            "EXECUTE" => Some(Self::Execute),
            "REVIEW" => Some(Self::Review),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Ledger pointer portion of a context snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStateSummary {
    /// Active epic at snapshot time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    /// Task the agent was working on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Phase at snapshot time.
    pub phase: Phase,
    /// Task ids already finished.
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    /// Task ids still outstanding.
    #[serde(default)]
    pub pending_tasks: Vec<String>,
}

/// Captured agent context for crash recovery and handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    /// Session the context belongs to.
    pub session_id: String,
    /// Agent running the session.
    pub agent_name: String,
    /// The prompt the agent is working from.
    pub prompt: String,
    /// Memory lines carried into the session.
    #[serde(default)]
    pub memories: Vec<String>,
    /// Ledger pointers at capture time.
    pub ledger_state: LedgerStateSummary,
    /// Trailing window of stream events at capture time.
    #[serde(default)]
    pub recent_events: Vec<Event>,
}

/// Kind of extracted learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LearningKind {
    /// An approach that worked.
    Pattern,
    /// An approach that failed and should be avoided.
    AntiPattern,
    /// A decision that was made and its context.
    Decision,
    /// A user preference.
    Preference,
    /// A correction issued by the user.
    Correction,
    /// A general insight.
    Insight,
}

/// A single learning derived from the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learning {
    /// Unique learning identifier.
    pub id: String,
    /// What kind of learning this is.
    pub kind: LearningKind,
    /// The learned content.
    pub content: String,
    /// Named entities mentioned, deduplicated, at most five.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    /// Extractor confidence in [0, 1].
    pub confidence: f64,
    /// Event the learning was derived from.
    pub source_event_id: String,
    /// When it was extracted.
    pub extracted_at: DateTime<Utc>,
}

/// What an upward signal asks the parent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// Relay a question to the human.
    AskUser,
    /// Spawn a helper agent.
    SpawnHelper,
    /// Record a metric.
    LogMetric,
}

/// Payload of an upward signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    /// What the parent is being asked to do.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Request data, schema per kind.
    pub data: serde_json::Value,
    /// Why the child is signalling.
    pub reason: String,
}

/// A signal queued from a child agent toward a busy parent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpwardSignal {
    /// Unique signal identifier.
    pub id: String,
    /// Agent that raised the signal.
    pub source_agent: String,
    /// Parent session the signal targets.
    pub target_session_id: String,
    /// The request itself.
    pub payload: SignalPayload,
    /// When the signal was queued.
    pub created_at: DateTime<Utc>,
}

/// A prompt held back until the target session goes idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredPrompt {
    /// Unique prompt identifier.
    pub id: String,
    /// Session the prompt should be delivered to.
    pub target_session_id: String,
    /// Agent the prompt addresses.
    pub agent: String,
    /// The prompt text.
    pub prompt: String,
    /// Adapter message id for reply matching, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// When the prompt was queued.
    pub created_at: DateTime<Utc>,
    /// Delivery attempts so far.
    pub attempts: u32,
}

/// Task execution status shared by the ledger and the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, not yet dispatched.
    Pending,
    /// Dispatched to an agent session.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Exceeded its time budget after exhausting retries.
    Timeout,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// How a finished unit of work went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Everything completed.
    Succeeded,
    /// Some parts completed.
    Partial,
    /// Nothing completed.
    Failed,
}

impl Outcome {
    /// Canonical upper-case rendering used in the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }
}

/// Estimated task complexity, used for adaptive supervision intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Quick task; poll frequently.
    Low,
    /// Moderate task.
    Medium,
    /// Long-running task; poll at the maximum interval.
    High,
}
