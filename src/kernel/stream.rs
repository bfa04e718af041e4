//! Durable event stream: append-only persistence, recovery-by-replay,
//! subscriber fan-out, lineage, checkpoints, and context snapshots.
//!
//! The stream owns `orchestration_stream.jsonl`. Every state change in the
//! core flows through [`EventStream::append`], which materializes the
//! event (id, timestamp, offset, metadata), persists it under the advisory
//! lock, and only then fans it out. Fan-out is non-blocking: each
//! subscriber has a bounded queue, and a slow subscriber loses events (the
//! loss is counted) rather than stalling appends.
//!
//! Recovery replays the log into memory: event map, bounded history ring,
//! offset high-water mark, unresolved checkpoints, context snapshots, and
//! the causation tree.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::kernel::ids::{self, Clock};
use crate::kernel::log::{AppendLog, LockPolicy, LogError};
use crate::types::{
    AgentContext, Checkpoint, CheckpointOption, CheckpointStatus, Event, EventMetadata, EventType,
};

/// Bounded queue length per subscriber.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Stream file name inside the base directory.
const STREAM_FILE: &str = "orchestration_stream.jsonl";

/// Snapshot directory name inside the base directory.
const SNAPSHOT_DIR: &str = "snapshots";

/// Checkpoint directory name inside the base directory.
const CHECKPOINT_DIR: &str = "checkpoints";

/// Event stream errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// An operation ran before [`EventStream::initialize`].
    #[error("event stream not initialized")]
    NotInitialized,
    /// Underlying log failure.
    #[error(transparent)]
    Log(#[from] LogError),
    /// Filesystem failure outside the log itself.
    #[error("stream io error at {path}: {source}")]
    Io {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Event (de)serialization failure.
    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Too many unresolved checkpoints.
    #[error("checkpoint limit reached ({limit} pending)")]
    CheckpointLimit {
        /// Configured cap on pending checkpoints.
        limit: usize,
    },
}

/// Tuning knobs for the stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Directory holding the stream file, snapshots, and checkpoints.
    pub base_dir: PathBuf,
    /// Rotate the stream file beyond this size.
    pub max_stream_size_mb: u64,
    /// Ring-buffer cap on in-memory history.
    pub max_history_size: usize,
    /// Cap on simultaneously pending checkpoints.
    pub max_checkpoints: usize,
    /// Default checkpoint lifetime before auto-expiry.
    pub checkpoint_timeout_ms: i64,
}

impl StreamConfig {
    /// Config rooted at `base_dir` with the stock defaults.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_stream_size_mb: 10,
            max_history_size: 1_000,
            max_checkpoints: 20,
            checkpoint_timeout_ms: 300_000,
        }
    }
}

/// The mutable fields of an event before the stream materializes it.
///
/// `source_agent` defaults to the actor when left empty.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    /// Event type tag.
    pub event_type: Option<EventType>,
    /// Session the event belongs to.
    pub session_id: String,
    /// Who produced the event.
    pub actor: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Causing event id.
    pub parent_event_id: Option<String>,
    /// Producing agent when different from the actor.
    pub source_agent: Option<String>,
    /// Targeted agent, if any.
    pub target_agent: Option<String>,
    /// Measured duration in milliseconds.
    pub duration: Option<u64>,
    /// Retry attempt this event belongs to.
    pub retry_count: Option<u32>,
    /// Embedded checkpoint for `checkpoint.*` events.
    pub checkpoint: Option<Checkpoint>,
}

/// An agent session that was spawned but never reported terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveIntent {
    /// Session the agent ran in.
    pub session_id: String,
    /// Agent name from the spawn event.
    pub agent: String,
}

/// What [`EventStream::resume`] recovered from disk.
#[derive(Debug, Default)]
pub struct ResumeReport {
    /// Events replayed into memory.
    pub events_replayed: u64,
    /// Malformed lines skipped during replay.
    pub lines_skipped: u64,
    /// Checkpoints still awaiting a decision.
    pub pending_checkpoints: Vec<Checkpoint>,
    /// Agents that were in flight when the process died.
    pub active_intents: Vec<ActiveIntent>,
}

impl ResumeReport {
    /// Human-readable recovery summary for the CLI.
    pub fn format_message(&self) -> String {
        if self.events_replayed == 0 {
            return "Stream is empty. Nothing to recover.".to_owned();
        }
        let mut parts = vec![format!("Replayed {} event(s).", self.events_replayed)];
        if self.lines_skipped > 0 {
            parts.push(format!("{} malformed line(s) skipped.", self.lines_skipped));
        }
        if !self.pending_checkpoints.is_empty() {
            parts.push(format!(
                "{} checkpoint(s) still pending a decision.",
                self.pending_checkpoints.len()
            ));
        }
        if !self.active_intents.is_empty() {
            parts.push(format!(
                "{} agent(s) were in flight: {}.",
                self.active_intents.len(),
                self.active_intents
                    .iter()
                    .map(|i| i.agent.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        parts.join(" ")
    }
}

/// Filter for [`EventStream::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Match this event type.
    pub event_type: Option<EventType>,
    /// Match this session.
    pub session_id: Option<String>,
    /// Match this actor.
    pub actor: Option<String>,
    /// Only events at or after this timestamp (unix ms).
    pub since_ms: Option<i64>,
    /// Cap on returned events.
    pub limit: Option<usize>,
}

/// A live subscription to the stream.
///
/// Dropping the subscription closes the queue; the stream prunes closed
/// subscribers on the next dispatch.
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id, usable with [`EventStream::unsubscribe`].
    pub id: u64,
    /// Matching events arrive here in append order.
    pub rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Events lost to back-pressure on this subscription so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    id: u64,
    /// `None` subscribes to every type (the `"*"` wildcard).
    filter: Option<EventType>,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct StreamState {
    initialized: bool,
    events: HashMap<String, Event>,
    history: VecDeque<Event>,
    current_offset: u64,
    has_events_in_segment: bool,
    pending_checkpoints: HashMap<String, Checkpoint>,
    snapshots: HashMap<String, AgentContext>,
    /// parent event id → child event ids, in append order.
    lineage: HashMap<String, Vec<String>>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    parse_warnings: u64,
}

/// The durable event stream.
///
/// One instance owns the stream file for the process. Constructed once at
/// startup and passed down as a handle; there is no hidden global.
pub struct EventStream {
    config: StreamConfig,
    clock: Arc<Clock>,
    correlation_id: String,
    log: Mutex<AppendLog>,
    state: Mutex<StreamState>,
}

impl EventStream {
    /// Create a stream rooted at `config.base_dir`.
    ///
    /// No filesystem work happens here; call [`EventStream::initialize`]
    /// before any other operation.
    pub fn new(config: StreamConfig, clock: Arc<Clock>) -> Result<Self, StreamError> {
        let log = AppendLog::new(config.base_dir.join(STREAM_FILE), LockPolicy::Required)?;
        Ok(Self {
            config,
            clock,
            correlation_id: ids::correlation_id(),
            log: Mutex::new(log),
            state: Mutex::new(StreamState::default()),
        })
    }

    /// Correlation id for this process run.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Malformed lines and snapshot files skipped so far.
    pub fn parse_warnings(&self) -> u64 {
        self.lock_state().parse_warnings
    }

    /// Ensure directories exist and replay the log from disk.
    pub fn initialize(&self) -> Result<ResumeReport, StreamError> {
        for dir in [
            self.config.base_dir.clone(),
            self.config.base_dir.join(SNAPSHOT_DIR),
            self.config.base_dir.join(CHECKPOINT_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StreamError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        self.lock_state().initialized = true;
        self.resume()
    }

    /// Quiesce subscribers and mark the stream unusable.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.subscribers.clear();
        state.initialized = false;
        info!("event stream shut down");
    }

    // ── Append and fan-out ──

    /// Materialize, persist, and fan out an event.
    ///
    /// The returned event carries the assigned id, timestamp, and offset.
    /// Fan-out happens after the append has been persisted; subscriber
    /// queues that are full drop the event and count the loss.
    pub fn append(&self, draft: EventDraft) -> Result<Event, StreamError> {
        let event_type = draft.event_type.unwrap_or(EventType::TaskProgress);
        let timestamp = self.clock.now_ms();

        let event = {
            let mut state = self.lock_state();
            if !state.initialized {
                return Err(StreamError::NotInitialized);
            }

            let mut log = self.lock_log();
            // Rotation must precede offset assignment: the first event of
            // a fresh segment starts back at zero.
            self.rotate_if_needed(&mut log, &mut state)?;

            let offset = if state.has_events_in_segment {
                state.current_offset.saturating_add(1)
            } else {
                0
            };

            let source_agent = draft
                .source_agent
                .unwrap_or_else(|| draft.actor.clone());
            let event = Event {
                id: ids::event_id(&self.correlation_id, timestamp, offset),
                event_type,
                timestamp,
                session_id: draft.session_id,
                parent_event_id: draft.parent_event_id,
                actor: draft.actor,
                payload: draft.payload,
                metadata: EventMetadata {
                    offset,
                    correlation_id: self.correlation_id.clone(),
                    source_agent,
                    target_agent: draft.target_agent,
                    duration: draft.duration,
                    retry_count: draft.retry_count,
                    extra: serde_json::Map::new(),
                },
                checkpoint: draft.checkpoint,
                extra: serde_json::Map::new(),
            };

            let line = serde_json::to_string(&event)?;
            log.append(&line)?;
            drop(log);

            state.current_offset = offset;
            state.has_events_in_segment = true;
            self.index_event(&mut state, event.clone());
            event
        };

        self.dispatch(&event);
        Ok(event)
    }

    /// Subscribe to a type tag, or `"*"` for everything.
    pub fn subscribe(&self, filter: &str) -> Subscription {
        let mut state = self.lock_state();
        let id = state.next_subscriber_id;
        state.next_subscriber_id = id.saturating_add(1);

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        state.subscribers.push(Subscriber {
            id,
            filter: (filter != "*").then(|| EventType::parse(filter)),
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { id, rx, dropped }
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        self.lock_state().subscribers.retain(|s| s.id != id);
    }

    // ── Queries ──

    /// Events matching the filter, oldest first.
    pub fn query(&self, filter: &EventFilter) -> Vec<Event> {
        let state = self.lock_state();
        let mut out: Vec<Event> = state
            .history
            .iter()
            .filter(|e| {
                filter
                    .event_type
                    .as_ref()
                    .is_none_or(|t| &e.event_type == t)
                    && filter
                        .session_id
                        .as_deref()
                        .is_none_or(|s| e.session_id == s)
                    && filter.actor.as_deref().is_none_or(|a| e.actor == a)
                    && filter.since_ms.is_none_or(|t| e.timestamp >= t)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Recent events, newest first, optionally filtered by type.
    pub fn get_event_history(&self, event_type: Option<&EventType>, limit: usize) -> Vec<Event> {
        let state = self.lock_state();
        state
            .history
            .iter()
            .rev()
            .filter(|e| event_type.is_none_or(|t| &e.event_type == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Fetch a single event by id.
    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.lock_state().events.get(id).cloned()
    }

    /// All transitive children of an event, breadth-first.
    pub fn get_descendants(&self, id: &str) -> Vec<String> {
        let state = self.lock_state();
        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = state.lineage.get(current) {
                for child in children {
                    out.push(child.clone());
                    queue.push_back(child.as_str());
                }
            }
        }
        out
    }

    // ── Checkpoints ──

    /// Open a checkpoint and persist the `checkpoint.requested` event.
    pub fn request_checkpoint(
        &self,
        session_id: &str,
        requested_by: &str,
        decision_point: &str,
        options: Vec<CheckpointOption>,
    ) -> Result<Checkpoint, StreamError> {
        {
            let state = self.lock_state();
            if !state.initialized {
                return Err(StreamError::NotInitialized);
            }
            if state.pending_checkpoints.len() >= self.config.max_checkpoints {
                return Err(StreamError::CheckpointLimit {
                    limit: self.config.max_checkpoints,
                });
            }
        }

        let now = self.clock.now_ms();
        let checkpoint = Checkpoint {
            id: ids::checkpoint_id(),
            decision_point: decision_point.to_owned(),
            options,
            requested_by: requested_by.to_owned(),
            requested_at: now,
            approved_by: None,
            approved_at: None,
            expires_at: now.saturating_add(self.config.checkpoint_timeout_ms),
            status: CheckpointStatus::Pending,
        };

        self.append(EventDraft {
            event_type: Some(EventType::CheckpointRequested),
            session_id: session_id.to_owned(),
            actor: requested_by.to_owned(),
            payload: serde_json::json!({ "decisionPoint": decision_point }),
            checkpoint: Some(checkpoint.clone()),
            ..EventDraft::default()
        })?;

        self.lock_state()
            .pending_checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Approve a pending checkpoint. Returns false when it is unknown or
    /// already resolved.
    pub fn approve_checkpoint(
        &self,
        checkpoint_id: &str,
        approved_by: &str,
        selected_option: Option<&str>,
    ) -> Result<bool, StreamError> {
        self.resolve_checkpoint(
            checkpoint_id,
            approved_by,
            CheckpointStatus::Approved,
            EventType::CheckpointApproved,
            serde_json::json!({
                "checkpointId": checkpoint_id,
                "selected_option": selected_option,
            }),
        )
    }

    /// Reject a pending checkpoint. Returns false when it is unknown or
    /// already resolved.
    pub fn reject_checkpoint(
        &self,
        checkpoint_id: &str,
        rejected_by: &str,
        reason: Option<&str>,
    ) -> Result<bool, StreamError> {
        self.resolve_checkpoint(
            checkpoint_id,
            rejected_by,
            CheckpointStatus::Rejected,
            EventType::CheckpointRejected,
            serde_json::json!({
                "checkpointId": checkpoint_id,
                "reason": reason,
            }),
        )
    }

    /// Auto-reject pending checkpoints past their deadline.
    ///
    /// Returns the ids that expired this sweep.
    pub fn expire_checkpoints(&self) -> Result<Vec<String>, StreamError> {
        let now = self.clock.now_ms();
        let expired: Vec<String> = {
            let state = self.lock_state();
            state
                .pending_checkpoints
                .values()
                .filter(|cp| cp.is_expired_at(now))
                .map(|cp| cp.id.clone())
                .collect()
        };
        for id in &expired {
            warn!(checkpoint_id = %id, "checkpoint expired without a decision");
            self.resolve_checkpoint(
                id,
                "system",
                CheckpointStatus::Expired,
                EventType::CheckpointRejected,
                serde_json::json!({ "checkpointId": id, "reason": "expired" }),
            )?;
        }
        Ok(expired)
    }

    /// Checkpoints still awaiting a decision, oldest first.
    pub fn get_pending_checkpoints(&self) -> Vec<Checkpoint> {
        let state = self.lock_state();
        let mut out: Vec<Checkpoint> = state.pending_checkpoints.values().cloned().collect();
        out.sort_by_key(|cp| cp.requested_at);
        out
    }

    fn resolve_checkpoint(
        &self,
        checkpoint_id: &str,
        resolver: &str,
        status: CheckpointStatus,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<bool, StreamError> {
        let resolved = {
            let mut state = self.lock_state();
            if !state.initialized {
                return Err(StreamError::NotInitialized);
            }
            match state.pending_checkpoints.remove(checkpoint_id) {
                Some(mut cp) => {
                    cp.status = status;
                    cp.approved_by = Some(resolver.to_owned());
                    cp.approved_at = Some(self.clock.now_ms());
                    Some(cp)
                }
                None => None,
            }
        };

        match resolved {
            Some(cp) => {
                self.append(EventDraft {
                    event_type: Some(event_type),
                    session_id: String::new(),
                    actor: resolver.to_owned(),
                    payload,
                    checkpoint: Some(cp),
                    ..EventDraft::default()
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Context snapshots ──

    /// Capture an agent context to disk and index it in memory.
    ///
    /// The snapshot file is immutable once written; the emitted
    /// `context.snapshot` event references it by path.
    pub fn create_context_snapshot(&self, context: AgentContext) -> Result<PathBuf, StreamError> {
        {
            let state = self.lock_state();
            if !state.initialized {
                return Err(StreamError::NotInitialized);
            }
        }

        let now = self.clock.now_ms();
        let path = self
            .config
            .base_dir
            .join(SNAPSHOT_DIR)
            .join(format!("{}_{now}.json", context.session_id));
        let body = serde_json::to_string_pretty(&context)?;
        std::fs::write(&path, body).map_err(|e| StreamError::Io {
            path: path.clone(),
            source: e,
        })?;

        self.append(EventDraft {
            event_type: Some(EventType::ContextSnapshot),
            session_id: context.session_id.clone(),
            actor: context.agent_name.clone(),
            payload: serde_json::json!({
                "sessionId": context.session_id,
                "agentName": context.agent_name,
                "path": path.to_string_lossy(),
            }),
            ..EventDraft::default()
        })?;

        self.lock_state()
            .snapshots
            .insert(context.session_id.clone(), context);
        Ok(path)
    }

    /// Restore the most recent context captured for a session.
    ///
    /// Emits `context.restored` when a snapshot is found.
    pub fn restore_context(&self, session_id: &str) -> Result<Option<AgentContext>, StreamError> {
        let found = self.lock_state().snapshots.get(session_id).cloned();
        if let Some(ref context) = found {
            self.append(EventDraft {
                event_type: Some(EventType::ContextRestored),
                session_id: session_id.to_owned(),
                actor: context.agent_name.clone(),
                payload: serde_json::json!({ "sessionId": session_id }),
                ..EventDraft::default()
            })?;
        }
        Ok(found)
    }

    /// Delete snapshot files older than `horizon_hours` by mtime.
    ///
    /// Returns how many files were removed. In-memory snapshots for
    /// removed files stay untouched; they die with the process.
    pub fn gc_snapshots(&self, horizon_hours: u64) -> Result<usize, StreamError> {
        let dir = self.config.base_dir.join(SNAPSHOT_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(StreamError::Io {
                    path: dir,
                    source: e,
                })
            }
        };

        let horizon = std::time::Duration::from_secs(horizon_hours.saturating_mul(3_600));
        let now = std::time::SystemTime::now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            let old_enough = now
                .duration_since(mtime)
                .map(|age| age >= horizon)
                .unwrap_or(false);
            if old_enough {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed = removed.saturating_add(1),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "snapshot gc failed to remove file");
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "snapshot gc removed stale files");
        }
        Ok(removed)
    }

    // ── Recovery ──

    /// Replay the on-disk log into memory.
    ///
    /// Rebuilds the event map, history ring, offset high-water mark,
    /// lineage tree, pending checkpoints, and snapshot index. Malformed
    /// lines are skipped and counted.
    pub fn resume(&self) -> Result<ResumeReport, StreamError> {
        let replayed = self.lock_log().read_all()?;

        let mut report = ResumeReport {
            lines_skipped: replayed.skipped,
            ..ResumeReport::default()
        };

        let mut state = self.lock_state();
        if !state.initialized {
            return Err(StreamError::NotInitialized);
        }
        state.events.clear();
        state.history.clear();
        state.lineage.clear();
        state.pending_checkpoints.clear();
        state.snapshots.clear();
        state.current_offset = 0;
        state.has_events_in_segment = false;

        // session id → agent for spawned-but-unfinished agents.
        let mut in_flight: HashMap<String, String> = HashMap::new();

        for line in &replayed.lines {
            let event: Event = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    state.parse_warnings = state.parse_warnings.saturating_add(1);
                    report.lines_skipped = report.lines_skipped.saturating_add(1);
                    debug!(error = %e, "skipping malformed stream line");
                    continue;
                }
            };

            report.events_replayed = report.events_replayed.saturating_add(1);
            if event.metadata.offset >= state.current_offset {
                state.current_offset = event.metadata.offset;
                state.has_events_in_segment = true;
            }

            match &event.event_type {
                EventType::CheckpointRequested => {
                    if let Some(cp) = &event.checkpoint {
                        if cp.approved_at.is_none() && cp.is_pending() {
                            state.pending_checkpoints.insert(cp.id.clone(), cp.clone());
                        }
                    }
                }
                EventType::CheckpointApproved | EventType::CheckpointRejected => {
                    if let Some(cp) = &event.checkpoint {
                        state.pending_checkpoints.remove(&cp.id);
                    }
                }
                EventType::ContextSnapshot => {
                    self.rehydrate_snapshot(&mut state, &event);
                }
                EventType::AgentSpawned => {
                    let agent = event
                        .payload
                        .get("agent")
                        .and_then(|v| v.as_str())
                        .unwrap_or(event.actor.as_str())
                        .to_owned();
                    in_flight.insert(event.session_id.clone(), agent);
                }
                EventType::AgentCompleted | EventType::AgentFailed => {
                    in_flight.remove(&event.session_id);
                }
                _ => {}
            }

            self.index_event(&mut state, event);
        }

        report.pending_checkpoints = {
            let mut pending: Vec<Checkpoint> =
                state.pending_checkpoints.values().cloned().collect();
            pending.sort_by_key(|cp| cp.requested_at);
            pending
        };
        report.active_intents = {
            let mut intents: Vec<ActiveIntent> = in_flight
                .into_iter()
                .map(|(session_id, agent)| ActiveIntent { session_id, agent })
                .collect();
            intents.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            intents
        };

        info!(
            events = report.events_replayed,
            skipped = report.lines_skipped,
            pending_checkpoints = report.pending_checkpoints.len(),
            "stream resumed from disk"
        );
        Ok(report)
    }

    /// Rehydrate a snapshot from the referenced file, or the inline copy.
    ///
    /// Missing and unparseable snapshot files are skipped.
    fn rehydrate_snapshot(&self, state: &mut StreamState, event: &Event) {
        if let Some(inline) = event.payload.get("context") {
            if let Ok(context) = serde_json::from_value::<AgentContext>(inline.clone()) {
                state.snapshots.insert(context.session_id.clone(), context);
                return;
            }
            state.parse_warnings = state.parse_warnings.saturating_add(1);
        }
        let Some(path) = event.payload.get("path").and_then(|v| v.as_str()) else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(body) => match serde_json::from_str::<AgentContext>(&body) {
                Ok(context) => {
                    state.snapshots.insert(context.session_id.clone(), context);
                }
                Err(e) => {
                    state.parse_warnings = state.parse_warnings.saturating_add(1);
                    debug!(path, error = %e, "skipping unparseable snapshot file");
                }
            },
            Err(e) => {
                state.parse_warnings = state.parse_warnings.saturating_add(1);
                debug!(path, error = %e, "skipping missing snapshot file");
            }
        }
    }

    // ── Internals ──

    fn index_event(&self, state: &mut StreamState, event: Event) {
        if let Some(parent) = &event.parent_event_id {
            state
                .lineage
                .entry(parent.clone())
                .or_default()
                .push(event.id.clone());
        }
        state.events.insert(event.id.clone(), event.clone());
        state.history.push_back(event);
        while state.history.len() > self.config.max_history_size {
            state.history.pop_front();
        }
    }

    /// Deliver an event to matching subscribers without blocking.
    fn dispatch(&self, event: &Event) {
        let mut state = self.lock_state();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &state.subscribers {
            let matches = sub
                .filter
                .as_ref()
                .is_none_or(|filter| filter == &event.event_type);
            if !matches {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = sub.id, "subscriber queue full, event dropped");
            }
        }
    }

    fn rotate_if_needed(
        &self,
        log: &mut AppendLog,
        state: &mut StreamState,
    ) -> Result<(), StreamError> {
        let max_bytes = self.config.max_stream_size_mb.saturating_mul(1_024 * 1_024);
        if max_bytes > 0 && log.size_bytes() > max_bytes {
            let suffix = self.clock.now_ms().to_string();
            log.rotate(&suffix)?;
            state.current_offset = 0;
            state.has_events_in_segment = false;
            info!(suffix, "stream rotated, offsets reset");
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, AppendLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
