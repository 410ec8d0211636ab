//! Run engine: step and phase advancement.
//!
//! `Engine::advance` processes exactly one step of a running run. The
//! transition helpers below are shared with the run service, which applies the
//! same step/phase/run transitions when a dispatched turn completes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guide_core::{
    Id, PhaseStatus, RunSnapshot, RunStatus, StepStatus, TimelineEventKind,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::execution::{ExecutionControls, ExecutionError};

pub const ACTOR_SYSTEM: &str = "system";
pub const ACTOR_POLICY: &str = "policy";
pub const ACTOR_USER: &str = "user";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run {run_id} is not running (status: {status})")]
    NotRunning { run_id: Id, status: RunStatus },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// What a step handler sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub run_id: Id,
    pub template_id: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub phase_id: String,
    pub step_id: String,
    pub prompt: String,
    pub user_prompt: String,
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub outcome: String,
    pub output: Option<String>,
}

impl StepOutcome {
    pub fn completed() -> Self {
        Self {
            outcome: "completed".to_string(),
            output: None,
        }
    }
}

/// Handler registered for a step id.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, ctx: &StepContext) -> std::result::Result<StepOutcome, ExecutionError>;
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advanced {
    /// A step completed and another one is pending.
    Step { phase_index: usize, step_index: usize },
    /// No pending steps remain; the run is `Completed`.
    RunCompleted,
}

/// Step/phase state machine.
pub struct Engine {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    controls: Arc<ExecutionControls>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Engine")
            .field("handlers", &handlers)
            .field("controls", &self.controls)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(ExecutionControls::default()))
    }
}

impl Engine {
    pub fn new(controls: Arc<ExecutionControls>) -> Self {
        Self {
            handlers: HashMap::new(),
            controls,
        }
    }

    /// Register a handler for a step id. Registered handlers win over built-ins.
    pub fn register(&mut self, step_id: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_id.into(), handler);
    }

    pub fn controls(&self) -> &ExecutionControls {
        &self.controls
    }

    /// Whether a step is executed in-process instead of dispatched.
    pub fn handles_locally(&self, step_id: &str) -> bool {
        self.handlers.contains_key(step_id) || self.controls.handles(step_id)
    }

    /// Process the first pending step of a running run.
    pub async fn advance(&self, snapshot: &mut RunSnapshot) -> Result<Advanced> {
        if snapshot.run.status != RunStatus::Running {
            return Err(EngineError::NotRunning {
                run_id: snapshot.run.id.clone(),
                status: snapshot.run.status,
            });
        }

        let Some(position) = snapshot.run.next_pending_position() else {
            complete_run(snapshot, Utc::now());
            return Ok(Advanced::RunCompleted);
        };

        let ctx = start_step(snapshot, position, Utc::now());
        if let Some(step) = snapshot.run.step_mut(position) {
            step.attempt += 1;
        }

        let result = self.invoke(&ctx).await;
        let now = Utc::now();

        match result {
            Ok(outcome) => {
                let next = complete_step(snapshot, position, &outcome, now);
                match next {
                    Some((phase_index, step_index)) => Ok(Advanced::Step {
                        phase_index,
                        step_index,
                    }),
                    None => {
                        complete_run(snapshot, now);
                        Ok(Advanced::RunCompleted)
                    }
                }
            }
            Err(err) => {
                if let ExecutionError::CapabilityDenied { capability, .. } = &err {
                    snapshot.run.audit_step(
                        "capability_denied",
                        ACTOR_SYSTEM,
                        &ctx.phase_id,
                        Some(&ctx.step_id),
                        format!("missing capability {capability}"),
                        now,
                    );
                }
                fail_step(snapshot, position, &err.to_string(), now);
                Err(err.into())
            }
        }
    }

    async fn invoke(&self, ctx: &StepContext) -> std::result::Result<StepOutcome, ExecutionError> {
        if let Some(handler) = self.handlers.get(&ctx.step_id) {
            debug!(run_id = %ctx.run_id, step_id = %ctx.step_id, "running registered step handler");
            return handler.handle(ctx).await;
        }
        if let Some(result) = self.controls.run_builtin(ctx).await {
            return result;
        }
        debug!(run_id = %ctx.run_id, step_id = %ctx.step_id, "no handler for step, completing");
        Ok(StepOutcome::completed())
    }
}

/// Handler context for the step at `position`.
pub(crate) fn step_context(snapshot: &RunSnapshot, position: (usize, usize)) -> StepContext {
    let run = &snapshot.run;
    let phase = &run.phases[position.0];
    let step = &phase.steps[position.1];
    StepContext {
        run_id: run.id.clone(),
        template_id: run.template.id.clone(),
        workspace_id: run.workspace_id.clone(),
        worktree_id: run.worktree_id.clone(),
        phase_id: phase.id.clone(),
        step_id: step.id.clone(),
        prompt: step.prompt.clone(),
        user_prompt: run.user_prompt.clone(),
    }
}

/// Point the run at `position`, start its phase if needed, and move the step to `Running`.
pub(crate) fn start_step(
    snapshot: &mut RunSnapshot,
    position: (usize, usize),
    now: DateTime<Utc>,
) -> StepContext {
    let (pi, si) = position;
    snapshot.run.set_position(position);

    let phase = &mut snapshot.run.phases[pi];
    let phase_id = phase.id.clone();
    if phase.status == PhaseStatus::Pending {
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(now);
        snapshot
            .run
            .audit_step("phase_started", ACTOR_SYSTEM, &phase_id, None, "", now);
        let name = snapshot.run.phases[pi].name.clone();
        snapshot.record(
            TimelineEventKind::PhaseStarted,
            Some(&phase_id),
            None,
            format!("phase {name} started"),
            now,
        );
    }

    let step = &mut snapshot.run.phases[pi].steps[si];
    step.reset();
    step.attempt = 0;
    step.status = StepStatus::Running;
    step.started_at = Some(now);
    let step_id = step.id.clone();
    let name = step.name.clone();

    snapshot.record(
        TimelineEventKind::StepStarted,
        Some(&phase_id),
        Some(&step_id),
        format!("step {name} started"),
        now,
    );
    debug!(run_id = %snapshot.run.id, phase_id = %phase_id, step_id = %step_id, "step started");

    step_context(snapshot, position)
}

/// Complete the step at `position` and its phase if every step is done.
/// Returns the next pending position, which the run pointer now refers to.
pub(crate) fn complete_step(
    snapshot: &mut RunSnapshot,
    position: (usize, usize),
    outcome: &StepOutcome,
    now: DateTime<Utc>,
) -> Option<(usize, usize)> {
    let (pi, si) = position;
    let phase_id = snapshot.run.phases[pi].id.clone();

    let step = &mut snapshot.run.phases[pi].steps[si];
    step.status = StepStatus::Completed;
    step.awaiting_turn = false;
    step.completed_at = Some(now);
    step.outcome = Some(outcome.outcome.clone());
    step.output.clone_from(&outcome.output);
    step.error = None;
    if let Some(execution) = step.execution.as_mut() {
        execution.completed_at = Some(now);
        let trace_id = execution.trace_id.clone();
        if let Some(attempt) = step
            .execution_attempts
            .iter_mut()
            .rev()
            .find(|a| a.trace_id == trace_id)
        {
            attempt.completed_at = Some(now);
        }
    }
    let step_id = step.id.clone();
    let name = step.name.clone();

    snapshot.record(
        TimelineEventKind::StepCompleted,
        Some(&phase_id),
        Some(&step_id),
        format!("step {name} completed ({})", outcome.outcome),
        now,
    );

    let phase = &mut snapshot.run.phases[pi];
    if phase.is_complete() && phase.status != PhaseStatus::Completed {
        phase.status = PhaseStatus::Completed;
        phase.completed_at = Some(now);
        let name = phase.name.clone();
        snapshot
            .run
            .audit_step("phase_completed", ACTOR_SYSTEM, &phase_id, None, "", now);
        snapshot.record(
            TimelineEventKind::PhaseCompleted,
            Some(&phase_id),
            None,
            format!("phase {name} completed"),
            now,
        );
    }

    let next = snapshot.run.next_pending_position();
    if let Some(next) = next {
        snapshot.run.set_position(next);
    }
    next
}

/// Fail the step at `position`, its phase, and the run.
pub(crate) fn fail_step(
    snapshot: &mut RunSnapshot,
    position: (usize, usize),
    error: &str,
    now: DateTime<Utc>,
) {
    let (pi, si) = position;
    let phase = &mut snapshot.run.phases[pi];
    phase.status = PhaseStatus::Failed;
    let phase_id = phase.id.clone();

    let step = &mut phase.steps[si];
    step.status = StepStatus::Failed;
    step.awaiting_turn = false;
    step.error = Some(error.to_string());
    step.completed_at = Some(now);
    let step_id = step.id.clone();

    snapshot.record(
        TimelineEventKind::StepFailed,
        Some(&phase_id),
        Some(&step_id),
        error,
        now,
    );
    fail_run(snapshot, error, now);
}

/// Move the run to `Failed` with `error` as its last error.
pub(crate) fn fail_run(snapshot: &mut RunSnapshot, error: &str, now: DateTime<Utc>) {
    let from = snapshot.run.status;
    snapshot.run.status = RunStatus::Failed;
    snapshot.run.last_error = Some(error.to_string());
    snapshot
        .run
        .audit_transition("run_failed", ACTOR_SYSTEM, from, RunStatus::Failed, error, now);
    snapshot.record(TimelineEventKind::RunFailed, None, None, error, now);
    warn!(run_id = %snapshot.run.id, error = %error, "run failed");
}

/// Move the run to `Completed`.
pub(crate) fn complete_run(snapshot: &mut RunSnapshot, now: DateTime<Utc>) {
    let from = snapshot.run.status;
    snapshot.run.status = RunStatus::Completed;
    snapshot.run.checkpoint_clearance = None;
    snapshot.run.audit_transition(
        "run_completed",
        ACTOR_SYSTEM,
        from,
        RunStatus::Completed,
        "",
        now,
    );
    snapshot.record(
        TimelineEventKind::RunCompleted,
        None,
        None,
        "run completed",
        now,
    );
    info!(run_id = %snapshot.run.id, "run completed");
}
