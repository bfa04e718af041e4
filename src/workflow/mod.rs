//! Declarative workflow engine.
//!
//! Workflows are markdown documents: a `---` frontmatter block (`name`,
//! `trigger`, `entry_agent`) followed by `## Phase N: <name>` sections
//! whose `- Agent:` blocks describe the steps. Execution is phased and
//! checkpoint-aware: a step marked `Checkpoint: true` pauses the run,
//! emits `ledger.task.yielded`, and persists engine state into the
//! ledger's `active_workflow` slot until the checkpoint is approved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kernel::stream::{EventDraft, EventStream, StreamError};
use crate::ledger::{LedgerError, LedgerStore};
use crate::runtime::{latest_assistant_text, CreateSessionRequest, RuntimeClient, RuntimeError, SessionState};
use crate::types::EventType;

/// Stored result cap per step, in characters.
const MAX_RESULT_CHARS: usize = 1_000;

/// Workflow errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The document did not parse.
    #[error("workflow parse error: {0}")]
    Parse(String),
    /// Ledger failure while persisting state.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Stream failure while emitting events or checkpoints.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Runtime failure while driving a step.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// A waited-on step never went idle.
    #[error("step {step_key} did not finish within the wait budget")]
    StepTimeout {
        /// `phase<i>_step<j>` key of the step.
        step_key: String,
    },
    /// Resume was requested while the checkpoint is still pending.
    #[error("workflow is paused on checkpoint {0}, which is still pending")]
    StillPaused(String),
    /// Resume was requested with no persisted state.
    #[error("no workflow state to resume")]
    NothingToResume,
}

/// One step of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStep {
    /// Agent to spawn.
    pub agent: String,
    /// Prompt template; `{{task}}` is substituted at run time.
    pub prompt: String,
    /// Whether to block until the step's session goes idle.
    pub wait: bool,
    /// Whether this step gates on a human checkpoint.
    pub checkpoint: bool,
}

/// One `## Phase N:` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPhase {
    /// Phase number from the header.
    pub number: u32,
    /// Phase name from the header.
    pub name: String,
    /// Steps in document order.
    pub steps: Vec<WorkflowStep>,
}

/// A parsed workflow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDef {
    /// Workflow name from the frontmatter.
    pub name: String,
    /// Trigger tags from the frontmatter.
    pub triggers: Vec<String>,
    /// Agent the workflow nominally starts with.
    pub entry_agent: String,
    /// Phases in document order.
    pub phases: Vec<WorkflowPhase>,
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Stepping through phases.
    Running,
    /// Blocked on a checkpoint decision.
    Paused,
    /// All phases done.
    Completed,
}

/// Engine state persisted in the ledger's `active_workflow` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Workflow name.
    pub name: String,
    /// Index of the phase being executed.
    pub phase_index: usize,
    /// Index of the step being executed within the phase.
    pub step_index: usize,
    /// Run status.
    pub status: WorkflowStatus,
    /// Truncated step results keyed `phase<i>_step<j>`.
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    /// Checkpoint the run is paused on, if paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Set once the pause's checkpoint was approved, so the gated step
    /// executes on resume instead of pausing again.
    #[serde(default)]
    pub checkpoint_cleared: bool,
}

// ── Parsing ──

/// Parse a workflow document.
pub fn parse(body: &str) -> Result<WorkflowDef, WorkflowError> {
    let (front, rest) = split_frontmatter(body)?;

    let mut name = None;
    let mut triggers = Vec::new();
    let mut entry_agent = None;
    for line in front.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "name" => name = Some(value.to_owned()),
            "entry_agent" => entry_agent = Some(value.to_owned()),
            "trigger" => {
                let trimmed = value.trim_start_matches('[').trim_end_matches(']');
                triggers = trimmed
                    .split(',')
                    .map(|t| t.trim().to_owned())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
            _ => {}
        }
    }

    let phase_re = Regex::new(r"^## Phase (\d+): (.+)$")
        .map_err(|e| WorkflowError::Parse(e.to_string()))?;

    let mut phases: Vec<WorkflowPhase> = Vec::new();
    for line in rest.lines() {
        if let Some(caps) = phase_re.captures(line) {
            let number = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(|| WorkflowError::Parse(format!("bad phase header: {line}")))?;
            let phase_name = caps
                .get(2)
                .map(|m| m.as_str().trim().to_owned())
                .unwrap_or_default();
            phases.push(WorkflowPhase {
                number,
                name: phase_name,
                steps: Vec::new(),
            });
            continue;
        }

        let Some(phase) = phases.last_mut() else {
            continue;
        };
        let trimmed = line.trim_start();
        let indented = line.starts_with(' ') || line.starts_with('\t');

        if !indented {
            if let Some(agent) = trimmed.strip_prefix("- Agent:") {
                phase.steps.push(WorkflowStep {
                    agent: agent.trim().to_owned(),
                    prompt: String::new(),
                    wait: true,
                    checkpoint: false,
                });
            }
            continue;
        }

        let Some(step) = phase.steps.last_mut() else {
            continue;
        };
        if let Some(prompt) = trimmed.strip_prefix("- Prompt:") {
            step.prompt = prompt.trim().trim_matches('"').to_owned();
        } else if let Some(wait) = trimmed.strip_prefix("- Wait:") {
            step.wait = wait.trim() == "true";
        } else if let Some(checkpoint) = trimmed.strip_prefix("- Checkpoint:") {
            step.checkpoint = checkpoint.trim() == "true";
        }
    }

    if phases.iter().all(|p| p.steps.is_empty()) {
        return Err(WorkflowError::Parse(
            "workflow has no steps in any phase".to_owned(),
        ));
    }

    Ok(WorkflowDef {
        name: name.ok_or_else(|| WorkflowError::Parse("frontmatter missing name".to_owned()))?,
        triggers,
        entry_agent: entry_agent
            .ok_or_else(|| WorkflowError::Parse("frontmatter missing entry_agent".to_owned()))?,
        phases,
    })
}

fn split_frontmatter(body: &str) -> Result<(&str, &str), WorkflowError> {
    let rest = body
        .strip_prefix("---")
        .ok_or_else(|| WorkflowError::Parse("missing frontmatter".to_owned()))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| WorkflowError::Parse("unterminated frontmatter".to_owned()))?;
    let front = &rest[..end];
    let after = rest
        .get(end.saturating_add(4)..)
        .unwrap_or_default();
    Ok((front, after))
}

// ── Execution ──

/// Drives a parsed workflow through the runtime.
pub struct WorkflowEngine {
    definition: WorkflowDef,
    ledger: Arc<LedgerStore>,
    stream: Arc<EventStream>,
    client: Arc<dyn RuntimeClient>,
    /// Poll interval while waiting on a step's session.
    wait_poll: Duration,
    /// Poll budget per waited-on step.
    wait_max_polls: u32,
}

impl WorkflowEngine {
    /// Assemble an engine for one workflow definition.
    pub fn new(
        definition: WorkflowDef,
        ledger: Arc<LedgerStore>,
        stream: Arc<EventStream>,
        client: Arc<dyn RuntimeClient>,
    ) -> Self {
        Self {
            definition,
            ledger,
            stream,
            client,
            wait_poll: Duration::from_millis(500),
            wait_max_polls: 240,
        }
    }

    /// Override wait polling (tests use tight budgets).
    pub fn with_wait_polling(mut self, poll: Duration, max_polls: u32) -> Self {
        self.wait_poll = poll;
        self.wait_max_polls = max_polls;
        self
    }

    /// The parsed definition.
    pub fn definition(&self) -> &WorkflowDef {
        &self.definition
    }

    /// Start the workflow from the beginning.
    pub async fn start(&self, task: &str) -> Result<WorkflowState, WorkflowError> {
        let state = WorkflowState {
            name: self.definition.name.clone(),
            phase_index: 0,
            step_index: 0,
            status: WorkflowStatus::Running,
            results: BTreeMap::new(),
            checkpoint_id: None,
            checkpoint_cleared: false,
        };
        info!(workflow = %self.definition.name, "workflow started");
        self.run_from(state, task).await
    }

    /// Resume after the pause checkpoint was approved.
    ///
    /// The approval event is the resume signal; resuming while the
    /// checkpoint is still pending is an error.
    pub async fn resume(&self, task: &str) -> Result<WorkflowState, WorkflowError> {
        let stored = self
            .ledger
            .active_workflow()?
            .ok_or(WorkflowError::NothingToResume)?;
        let mut state: WorkflowState = serde_json::from_value(stored)
            .map_err(|e| WorkflowError::Parse(format!("stored workflow state: {e}")))?;

        if let Some(checkpoint_id) = &state.checkpoint_id {
            let still_pending = self
                .stream
                .get_pending_checkpoints()
                .iter()
                .any(|cp| &cp.id == checkpoint_id);
            if still_pending {
                return Err(WorkflowError::StillPaused(checkpoint_id.clone()));
            }
        }

        state.status = WorkflowStatus::Running;
        state.checkpoint_id = None;
        state.checkpoint_cleared = true;
        info!(workflow = %state.name, phase = state.phase_index, "workflow resumed");
        self.run_from(state, task).await
    }

    async fn run_from(
        &self,
        mut state: WorkflowState,
        task: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        while state.phase_index < self.definition.phases.len() {
            let phase = &self.definition.phases[state.phase_index];
            // Skipped on resume: the phase already announced itself
            // before the pause.
            if state.step_index == 0 && !state.checkpoint_cleared {
                self.emit(
                    EventType::LedgerProgressPhaseStarted,
                    serde_json::json!({ "workflow": state.name, "phase": phase.name }),
                );
            }

            while state.step_index < phase.steps.len() {
                let step = &phase.steps[state.step_index];
                let step_key = format!(
                    "phase{}_step{}",
                    state.phase_index, state.step_index
                );

                if step.checkpoint && !state.checkpoint_cleared {
                    return self.pause(state, phase, &step_key).await;
                }
                state.checkpoint_cleared = false;

                let result = self.run_step(step, &step_key, task, &state).await?;
                if let Some(result) = result {
                    state.results.insert(step_key, result);
                }
                state.step_index = state.step_index.saturating_add(1);
                self.persist(&state)?;
            }

            self.emit(
                EventType::LedgerProgressPhaseCompleted,
                serde_json::json!({ "workflow": state.name, "phase": phase.name }),
            );
            state.phase_index = state.phase_index.saturating_add(1);
            state.step_index = 0;
            self.persist(&state)?;
        }

        state.status = WorkflowStatus::Completed;
        self.ledger.set_active_workflow(None)?;
        info!(workflow = %state.name, "workflow completed");
        Ok(state)
    }

    async fn pause(
        &self,
        mut state: WorkflowState,
        phase: &WorkflowPhase,
        step_key: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        let checkpoint = self.stream.request_checkpoint(
            "",
            &self.definition.entry_agent,
            &format!(
                "workflow {} phase {} ({}) awaiting approval",
                state.name, phase.number, phase.name
            ),
            vec![],
        )?;
        state.status = WorkflowStatus::Paused;
        state.checkpoint_id = Some(checkpoint.id.clone());
        self.emit(
            EventType::LedgerTaskYielded,
            serde_json::json!({
                "workflow": state.name,
                "stepKey": step_key,
                "checkpointId": checkpoint.id,
            }),
        );
        self.persist(&state)?;
        info!(workflow = %state.name, checkpoint = %checkpoint.id, "workflow paused on checkpoint");
        Ok(state)
    }

    /// Spawn the step's agent and, when waiting, harvest its output.
    async fn run_step(
        &self,
        step: &WorkflowStep,
        step_key: &str,
        task: &str,
        state: &WorkflowState,
    ) -> Result<Option<String>, WorkflowError> {
        let mut prompt = step.prompt.replace("{{task}}", task);
        if !state.results.is_empty() {
            let condensed = serde_json::to_string(&state.results)
                .unwrap_or_else(|_| "{}".to_owned());
            prompt.push_str("\n\nPrior step results: ");
            prompt.push_str(&condensed);
        }

        let session_id = self
            .client
            .create_session(CreateSessionRequest {
                parent_id: None,
                title: format!("{}: {step_key}", self.definition.name),
            })
            .await?;
        self.client.prompt(&session_id, &step.agent, &prompt).await?;
        debug!(step_key, agent = %step.agent, session_id = %session_id, "workflow step dispatched");
        self.emit(
            EventType::AgentSpawned,
            serde_json::json!({
                "agent": step.agent,
                "workflow": self.definition.name,
                "stepKey": step_key,
            }),
        );

        if !step.wait {
            return Ok(None);
        }

        for _ in 0..self.wait_max_polls {
            let states = self.client.status().await?;
            if states.get(&session_id) == Some(&SessionState::Idle) {
                let messages = self.client.messages(&session_id).await?;
                let result = latest_assistant_text(&messages).unwrap_or_default();
                let truncated: String = result.chars().take(MAX_RESULT_CHARS).collect();
                return Ok(Some(truncated));
            }
            tokio::time::sleep(self.wait_poll).await;
        }
        Err(WorkflowError::StepTimeout {
            step_key: step_key.to_owned(),
        })
    }

    fn persist(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(state)
            .map_err(|e| WorkflowError::Parse(format!("state serialization: {e}")))?;
        self.ledger.set_active_workflow(Some(value))?;
        Ok(())
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        let draft = EventDraft {
            event_type: Some(event_type),
            session_id: String::new(),
            actor: "workflow".to_owned(),
            payload,
            ..EventDraft::default()
        };
        if let Err(e) = self.stream.append(draft) {
            warn!(error = %e, "workflow event emission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ids::Clock;
    use crate::kernel::stream::StreamConfig;
    use crate::runtime::mock::MockRuntimeClient;
    use tempfile::TempDir;

    const DOC: &str = r#"---
name: ship-feature
trigger: [feature_request, manual]
entry_agent: planner
---

## Phase 1: Plan

- Agent: planner
  - Prompt: "Plan {{task}}"
  - Wait: true
  - Checkpoint: false

## Phase 2: Execute

- Agent: executor
  - Prompt: "Execute the plan"
  - Wait: false
  - Checkpoint: true
- Agent: validator
  - Prompt: "Validate {{task}}"
  - Wait: false
"#;

    // ── Parsing ──

    #[test]
    fn test_parse_document() {
        let def = parse(DOC).expect("parse");
        assert_eq!(def.name, "ship-feature");
        assert_eq!(def.triggers, vec!["feature_request", "manual"]);
        assert_eq!(def.entry_agent, "planner");
        assert_eq!(def.phases.len(), 2);

        let plan = &def.phases[0];
        assert_eq!((plan.number, plan.name.as_str()), (1, "Plan"));
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].agent, "planner");
        assert_eq!(plan.steps[0].prompt, "Plan {{task}}");
        assert!(plan.steps[0].wait);
        assert!(!plan.steps[0].checkpoint);

        let execute = &def.phases[1];
        assert_eq!(execute.steps.len(), 2);
        assert!(execute.steps[0].checkpoint);
        assert!(!execute.steps[0].wait);
        assert!(!execute.steps[1].checkpoint, "checkpoint defaults false");
    }

    #[test]
    fn test_parse_rejects_missing_frontmatter() {
        assert!(matches!(
            parse("## Phase 1: Plan\n- Agent: x\n"),
            Err(WorkflowError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_workflow() {
        let doc = "---\nname: empty\nentry_agent: a\n---\n\n## Phase 1: Nothing\n";
        assert!(matches!(parse(doc), Err(WorkflowError::Parse(_))));
    }

    // ── Execution ──

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<LedgerStore>,
        stream: Arc<EventStream>,
        mock: Arc<MockRuntimeClient>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let base = dir.path().join(".opencode");
        let stream = Arc::new(
            EventStream::new(StreamConfig::new(&base), Arc::new(Clock::new())).expect("stream"),
        );
        stream.initialize().expect("initialize");
        let ledger = Arc::new(LedgerStore::new(&base, "ses_test"));
        ledger.initialize().expect("ledger init");
        Fixture {
            _dir: dir,
            ledger,
            stream,
            mock: Arc::new(MockRuntimeClient::new()),
        }
    }

    fn engine(fixture: &Fixture, doc: &str) -> WorkflowEngine {
        WorkflowEngine::new(
            parse(doc).expect("parse"),
            Arc::clone(&fixture.ledger),
            Arc::clone(&fixture.stream),
            Arc::clone(&fixture.mock) as Arc<dyn RuntimeClient>,
        )
        .with_wait_polling(Duration::from_millis(5), 50)
    }

    #[tokio::test]
    async fn test_run_pauses_on_checkpoint_and_resumes() {
        let fixture = fixture();
        let engine = engine(&fixture, DOC);

        // The planner session completes as soon as it is created.
        let mock = Arc::clone(&fixture.mock);
        let completer = tokio::spawn(async move {
            loop {
                mock.set_idle("mock_ses_0", true);
                mock.push_assistant_message("mock_ses_0", 1, "the plan");
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let state = engine.start("add OAuth").await.expect("start");
        completer.abort();

        // Phase 1 ran and stored its result; phase 2 paused at the gate.
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert_eq!(state.phase_index, 1);
        assert_eq!(state.step_index, 0);
        assert!(state.results.get("phase0_step0").is_some_and(|r| r.contains("the plan")));
        let checkpoint_id = state.checkpoint_id.clone().expect("checkpoint");

        // Prompt substitution happened.
        let prompts = fixture.mock.prompts();
        assert_eq!(prompts[0].text, "Plan add OAuth");

        // State persisted in the ledger slot.
        let stored = fixture.ledger.active_workflow().expect("read").expect("stored");
        let stored: WorkflowState = serde_json::from_value(stored).expect("state");
        assert_eq!(stored.status, WorkflowStatus::Paused);

        // Resume before approval is refused.
        assert!(matches!(
            engine.resume("add OAuth").await,
            Err(WorkflowError::StillPaused(_))
        ));

        // Approval is the resume signal.
        fixture
            .stream
            .approve_checkpoint(&checkpoint_id, "user", Some("go"))
            .expect("approve");
        let state = engine.resume("add OAuth").await.expect("resume");
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.phase_index, 2);

        // The gated step and its successor both dispatched.
        let prompts = fixture.mock.prompts();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[1].agent, "executor");
        assert_eq!(prompts[2].agent, "validator");
        // Prior results were appended to later prompts.
        assert!(prompts[1].text.contains("Prior step results"));

        // Completion clears the ledger slot.
        assert!(fixture.ledger.active_workflow().expect("read").is_none());
    }

    #[tokio::test]
    async fn test_non_wait_steps_store_no_result() {
        let fixture = fixture();
        let doc = r#"---
name: fire-and-forget
entry_agent: executor
---

## Phase 1: Kick

- Agent: executor
  - Prompt: "Go {{task}}"
  - Wait: false
"#;
        let engine = engine(&fixture, doc);
        let state = engine.start("now").await.expect("start");
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(state.results.is_empty());
        assert_eq!(fixture.mock.prompts()[0].text, "Go now");
    }

    #[tokio::test]
    async fn test_wait_step_times_out() {
        let fixture = fixture();
        let doc = r#"---
name: stuck
entry_agent: executor
---

## Phase 1: Wait

- Agent: executor
  - Prompt: "never finishes"
  - Wait: true
"#;
        let engine = WorkflowEngine::new(
            parse(doc).expect("parse"),
            Arc::clone(&fixture.ledger),
            Arc::clone(&fixture.stream),
            Arc::clone(&fixture.mock) as Arc<dyn RuntimeClient>,
        )
        .with_wait_polling(Duration::from_millis(1), 3);

        // Session never goes idle.
        let err = engine.start("task").await.expect_err("timeout");
        assert!(matches!(err, WorkflowError::StepTimeout { .. }));
    }

    #[tokio::test]
    async fn test_resume_without_state_fails() {
        let fixture = fixture();
        let engine = engine(&fixture, DOC);
        assert!(matches!(
            engine.resume("task").await,
            Err(WorkflowError::NothingToResume)
        ));
    }
}
