//! Core types for guided workflow runs.
//!
//! Templates are immutable blueprints. A `WorkflowRun` is the aggregate root
//! instantiated from a template; phases and steps are snapshotted at creation
//! so later template edits never reach an existing run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{RunTimelineEvent, TimelineEventKind};
use crate::policy::{CheckpointDecisionMetadata, CheckpointPolicy};

/// Unique identifier for runs and timeline events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Link between a step and its external execution. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    None,
    Linked,
    Unavailable,
    Deferred,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Linked => "linked",
            Self::Unavailable => "unavailable",
            Self::Deferred => "deferred",
        }
    }
}

/// Sandbox level requested for agent turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    ReadOnly,
    #[default]
    WorkspaceWrite,
    FullAccess,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::WorkspaceWrite => "workspace_write",
            Self::FullAccess => "full_access",
        }
    }
}

/// Who produced a checkpoint decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Policy,
    User,
    System,
}

// --- Templates ---

/// Per-step overrides forwarded to the step prompt dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRuntimeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<AccessLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_options: Option<StepRuntimeOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatePhase {
    pub id: String,
    pub name: String,
    pub steps: Vec<TemplateStep>,
}

/// Immutable blueprint a run is instantiated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_access_level: AccessLevel,
    pub phases: Vec<TemplatePhase>,
}

// --- Runs ---

/// Template identity captured at creation; not a live pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTemplateRef {
    pub id: String,
    pub name: String,
}

/// One dispatched execution of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRef {
    /// `run:phase:step:attempt-N`
    pub trace_id: String,
    pub session_id: String,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub name: String,
    /// Prompt captured from the template at run creation.
    pub prompt: String,
    #[serde(default)]
    pub runtime_options: Option<StepRuntimeOptions>,
    pub status: StepStatus,
    /// Dispatched and waiting on an external turn. Only valid while `Running`.
    #[serde(default)]
    pub awaiting_turn: bool,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution: Option<ExecutionRef>,
    #[serde(default)]
    pub execution_attempts: Vec<ExecutionRef>,
    #[serde(default)]
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    fn from_template(step: &TemplateStep) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            prompt: step.prompt.clone(),
            runtime_options: step.runtime_options.clone(),
            status: StepStatus::Pending,
            awaiting_turn: false,
            turn_id: None,
            attempt: 0,
            outcome: None,
            output: None,
            error: None,
            execution: None,
            execution_attempts: Vec::new(),
            execution_state: ExecutionState::None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Return the step to `Pending`, dropping everything a previous attempt left behind.
    /// Execution history is kept.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.awaiting_turn = false;
        self.turn_id = None;
        self.outcome = None;
        self.output = None;
        self.error = None;
        self.execution = None;
        self.execution_state = ExecutionState::None;
        self.started_at = None;
        self.completed_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRun {
    pub id: String,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRun>,
}

impl PhaseRun {
    /// A phase is complete iff every step is `Completed`.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

/// Append-only record of a state change on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAuditEntry {
    pub at: DateTime<Utc>,
    pub action: String,
    /// `system`, `policy`, or `user`.
    pub actor: String,
    #[serde(default)]
    pub from_status: Option<RunStatus>,
    #[serde(default)]
    pub to_status: Option<RunStatus>,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDecision {
    /// Sequential per run (`decision-1`, `decision-2`, ...).
    pub id: String,
    pub run_id: Id,
    pub phase_id: String,
    pub step_id: String,
    /// `pause`, `approve_continue`, `request_revision`, `pause_run`, ...
    pub decision: String,
    pub reason: String,
    pub source: DecisionSource,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    pub metadata: CheckpointDecisionMetadata,
}

/// Caller-supplied context a run is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub workspace_id: String,
    pub worktree_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub user_prompt: String,
}

/// One executing instance of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Id,
    pub template: RunTemplateRef,
    pub workspace_id: String,
    pub worktree_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub user_prompt: String,
    pub status: RunStatus,
    /// The only position pointer: first pending step in document order.
    pub current_phase_index: usize,
    pub current_step_index: usize,
    pub phases: Vec<PhaseRun>,
    /// Effective policy (base merged with per-run overrides).
    pub policy: CheckpointPolicy,
    #[serde(default)]
    pub latest_decision: Option<CheckpointDecision>,
    #[serde(default)]
    pub decisions: Vec<CheckpointDecision>,
    #[serde(default)]
    pub audit: Vec<RunAuditEntry>,
    /// `phase_id/step_id` of a step a human already cleared past its checkpoint.
    #[serde(default)]
    pub checkpoint_clearance: Option<String>,
    #[serde(default)]
    pub dismissed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a fresh run mirroring the template 1:1 with every step pending.
    pub fn instantiate(
        id: Id,
        template: &WorkflowTemplate,
        context: RunContext,
        policy: CheckpointPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let phases = template
            .phases
            .iter()
            .map(|phase| PhaseRun {
                id: phase.id.clone(),
                name: phase.name.clone(),
                status: PhaseStatus::Pending,
                started_at: None,
                completed_at: None,
                steps: phase.steps.iter().map(StepRun::from_template).collect(),
            })
            .collect();

        Self {
            id,
            template: RunTemplateRef {
                id: template.id.clone(),
                name: template.name.clone(),
            },
            workspace_id: context.workspace_id,
            worktree_id: context.worktree_id,
            session_id: context.session_id.filter(|s| !s.is_empty()),
            task_id: context.task_id.filter(|s| !s.is_empty()),
            user_prompt: context.user_prompt,
            status: RunStatus::Created,
            current_phase_index: 0,
            current_step_index: 0,
            phases,
            policy,
            latest_decision: None,
            decisions: Vec::new(),
            audit: Vec::new(),
            checkpoint_clearance: None,
            dismissed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// First pending step in document order.
    pub fn next_pending_position(&self) -> Option<(usize, usize)> {
        self.phases.iter().enumerate().find_map(|(pi, phase)| {
            phase
                .steps
                .iter()
                .position(|s| s.status == StepStatus::Pending)
                .map(|si| (pi, si))
        })
    }

    /// Step currently dispatched and waiting for its turn to complete.
    pub fn awaiting_position(&self) -> Option<(usize, usize)> {
        self.phases.iter().enumerate().find_map(|(pi, phase)| {
            phase
                .steps
                .iter()
                .position(|s| s.awaiting_turn && s.status == StepStatus::Running)
                .map(|si| (pi, si))
        })
    }

    pub fn step(&self, position: (usize, usize)) -> Option<&StepRun> {
        self.phases
            .get(position.0)
            .and_then(|phase| phase.steps.get(position.1))
    }

    pub fn step_mut(&mut self, position: (usize, usize)) -> Option<&mut StepRun> {
        self.phases
            .get_mut(position.0)
            .and_then(|phase| phase.steps.get_mut(position.1))
    }

    pub fn set_position(&mut self, position: (usize, usize)) {
        self.current_phase_index = position.0;
        self.current_step_index = position.1;
    }

    /// Counts against the active-run cap.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal() && self.dismissed_at.is_none()
    }

    pub fn next_decision_id(&self) -> String {
        format!("decision-{}", self.decisions.len() + 1)
    }

    /// Append an audit entry. Timestamps never go backwards.
    pub fn push_audit(&mut self, mut entry: RunAuditEntry) {
        entry.at = not_before(entry.at, self.audit.last().map(|e| e.at));
        self.updated_at = entry.at.max(self.updated_at);
        self.audit.push(entry);
    }

    /// Shorthand for a status transition audit entry.
    pub fn audit_transition(
        &mut self,
        action: &str,
        actor: &str,
        from: RunStatus,
        to: RunStatus,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.push_audit(RunAuditEntry {
            at: now,
            action: action.to_string(),
            actor: actor.to_string(),
            from_status: Some(from),
            to_status: Some(to),
            phase_id: None,
            step_id: None,
            detail: detail.into(),
        });
    }

    /// Shorthand for an audit entry scoped to a phase/step.
    pub fn audit_step(
        &mut self,
        action: &str,
        actor: &str,
        phase_id: &str,
        step_id: Option<&str>,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.push_audit(RunAuditEntry {
            at: now,
            action: action.to_string(),
            actor: actor.to_string(),
            from_status: None,
            to_status: None,
            phase_id: Some(phase_id.to_string()),
            step_id: step_id.map(str::to_string),
            detail: detail.into(),
        });
    }

    /// Append a checkpoint decision to the history and point `latest_decision` at it.
    pub fn record_decision(&mut self, decision: CheckpointDecision) {
        self.latest_decision = Some(decision.clone());
        self.decisions.push(decision);
    }
}

/// Clamp `at` so it is never earlier than `floor`.
pub fn not_before(at: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match floor {
        Some(floor) if floor > at => floor,
        _ => at,
    }
}

/// Run plus its timeline; the unit of persistence and of the in-memory run table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    #[serde(default)]
    pub timeline: Vec<RunTimelineEvent>,
}

impl RunSnapshot {
    pub fn new(run: WorkflowRun) -> Self {
        Self {
            run,
            timeline: Vec::new(),
        }
    }

    /// Append a timeline event. Timestamps never go backwards.
    pub fn record(
        &mut self,
        kind: TimelineEventKind,
        phase_id: Option<&str>,
        step_id: Option<&str>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let at = not_before(now, self.timeline.last().map(|e| e.at));
        self.timeline.push(RunTimelineEvent {
            id: Id::new(),
            run_id: self.run.id.clone(),
            kind,
            phase_id: phase_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            message: message.into(),
            at,
        });
        self.run.updated_at = at.max(self.run.updated_at);
    }
}

/// Persisted context of a dismissed run, enough to rebuild a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissedRunRecord {
    pub run_id: Id,
    pub template: RunTemplateRef,
    pub workspace_id: String,
    pub worktree_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dismissed_at: DateTime<Utc>,
}

impl DismissedRunRecord {
    pub fn from_run(run: &WorkflowRun, dismissed_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run.id.clone(),
            template: run.template.clone(),
            workspace_id: run.workspace_id.clone(),
            worktree_id: run.worktree_id.clone(),
            session_id: run.session_id.clone(),
            created_at: run.created_at,
            dismissed_at,
        }
    }

    /// Minimal run standing in for a dismissed run whose record is gone.
    pub fn tombstone(&self) -> WorkflowRun {
        WorkflowRun {
            id: self.run_id.clone(),
            template: self.template.clone(),
            workspace_id: self.workspace_id.clone(),
            worktree_id: self.worktree_id.clone(),
            session_id: self.session_id.clone(),
            task_id: None,
            user_prompt: String::new(),
            status: RunStatus::Failed,
            current_phase_index: 0,
            current_step_index: 0,
            phases: Vec::new(),
            policy: CheckpointPolicy::default(),
            latest_decision: None,
            decisions: Vec::new(),
            audit: Vec::new(),
            checkpoint_clearance: None,
            dismissed_at: Some(self.dismissed_at),
            last_error: Some("run record unavailable".to_string()),
            created_at: self.created_at,
            updated_at: self.dismissed_at,
        }
    }
}
