//! Run service.
//!
//! Owns the run table and exposes every run operation. The whole table sits
//! behind one read/write lock: mutations take the write half for their full
//! duration, queries take the read half and hand back owned copies. Snapshot
//! and metrics writes go through the background `SnapshotWriter`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guide_core::config::{ConfigError, TurnMatcherKind};
use guide_core::policy::{
    self, CheckpointAction, CheckpointDecisionMetadata, CheckpointPolicy,
    CheckpointPolicyOverrides, PolicyError,
};
use guide_core::templates::builtin_templates;
use guide_core::{
    CheckpointDecision, Config, DecisionSource, DismissedRunRecord, ExecutionRef, ExecutionState,
    Id, PhaseStatus, RunAuditEntry, RunContext, RunSnapshot, RunStatus, RunTimelineEvent,
    StepStatus, TimelineEventKind, WorkflowRun, WorkflowTemplate,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, ConfidenceSource, FixedConfidence};
use crate::dispatch::{
    BoundedExponentialDispatchRetryPolicy, DispatchErrorClass, DispatchErrorClassifier,
    DispatchRetryAttempt, DispatchRetryPolicy, DispatchRetryScheduler, StepDispatchRequest,
    StepPromptDispatcher, TransientHintClassifier,
};
use crate::engine::{
    self, Advanced, Engine, EngineError, StepHandler, StepOutcome, ACTOR_POLICY, ACTOR_SYSTEM,
    ACTOR_USER,
};
use crate::execution::{ExecutionControls, ExecutionError, ExecutionRunner, NoopRunner};
use crate::metrics::RunMetrics;
use crate::storage::{RunMetricsStore, RunSnapshotStore, StorageError, TemplateProvider};
use crate::turns::{accepts_turns, matcher_for, TurnSignal, TurnSignalMatcher};
use crate::writer::SnapshotWriter;

const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("guided workflows are disabled")]
    Disabled,
    #[error("missing run context: {0}")]
    MissingContext(&'static str),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(Id),
    #[error("invalid transition: cannot {action} a run in status {status}")]
    InvalidTransition { action: String, status: RunStatus },
    #[error("active run limit reached ({0})")]
    RunLimitExceeded(usize),
    #[error("step dispatch unavailable: {0}")]
    StepDispatchUnavailable(String),
    #[error("step dispatch deferred: {0}")]
    StepDispatchDeferred(String),
    #[error("step dispatch failed: {0}")]
    StepDispatchFatal(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotRunning { status, .. } => Self::InvalidTransition {
                action: "advance".to_string(),
                status,
            },
            EngineError::Execution(e) => Self::Execution(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// --- Requests ---

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CreateRunRequest {
    pub template_id: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub user_prompt: String,
    /// Per-run overrides merged over the configured base policy.
    pub policy: Option<CheckpointPolicyOverrides>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    ApproveContinue,
    RequestRevision,
    PauseRun,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveContinue => "approve_continue",
            Self::RequestRevision => "request_revision",
            Self::PauseRun => "pause_run",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve_continue" => Some(Self::ApproveContinue),
            "request_revision" => Some(Self::RequestRevision),
            "pause_run" => Some(Self::PauseRun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecisionRequest {
    pub action: String,
    /// Decision being answered. Without it the request carries no replay protection.
    pub decision_id: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunListFilter {
    pub workspace_id: Option<String>,
    pub include_dismissed: bool,
}

// --- Configuration ---

/// Validated service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workflows_enabled: bool,
    pub max_active_runs: usize,
    pub telemetry_enabled: bool,
    pub base_policy: CheckpointPolicy,
    pub default_confidence: f64,
    pub turn_matcher: TurnMatcherKind,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl ServiceConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.command_max_attempts == 0 {
            return Err(invalid_number("command_max_attempts", 0).into());
        }
        if !(0.0..=1.0).contains(&config.default_confidence) {
            return Err(PolicyError::ThresholdOutOfRange {
                field: "default_confidence",
                value: config.default_confidence,
            }
            .into());
        }
        if config.dispatch_retry_initial_ms == 0 {
            return Err(invalid_number("dispatch_retry_initial_ms", 0).into());
        }
        if config.dispatch_retry_max_ms < config.dispatch_retry_initial_ms {
            return Err(
                invalid_number("dispatch_retry_max_ms", config.dispatch_retry_max_ms).into(),
            );
        }

        Ok(Self {
            workflows_enabled: config.workflows_enabled,
            max_active_runs: config.max_active_runs,
            telemetry_enabled: config.telemetry_enabled,
            base_policy: config.policy()?,
            default_confidence: config.default_confidence,
            turn_matcher: config.turn_matcher,
            retry_initial: Duration::from_millis(config.dispatch_retry_initial_ms),
            retry_max: Duration::from_millis(config.dispatch_retry_max_ms),
        })
    }
}

fn invalid_number(key: &str, value: u64) -> ConfigError {
    ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Collaborators and settings for a `RunService`.
pub struct RunServiceBuilder {
    config: Config,
    snapshot_store: Option<Arc<dyn RunSnapshotStore>>,
    metrics_store: Option<Arc<dyn RunMetricsStore>>,
    templates: Option<Arc<dyn TemplateProvider>>,
    dispatcher: Option<Arc<dyn StepPromptDispatcher>>,
    classifier: Option<Arc<dyn DispatchErrorClassifier>>,
    retry_policy: Option<Arc<dyn DispatchRetryPolicy>>,
    matcher: Option<Arc<dyn TurnSignalMatcher>>,
    confidence: Option<Arc<dyn ConfidenceSource>>,
    runner: Option<Arc<dyn ExecutionRunner>>,
    handlers: Vec<(String, Arc<dyn StepHandler>)>,
}

impl std::fmt::Debug for RunServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers: Vec<&str> = self.handlers.iter().map(|(id, _)| id.as_str()).collect();
        f.debug_struct("RunServiceBuilder")
            .field("config", &self.config)
            .field("persistent", &self.snapshot_store.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .field("handlers", &handlers)
            .finish_non_exhaustive()
    }
}

impl RunServiceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            snapshot_store: None,
            metrics_store: None,
            templates: None,
            dispatcher: None,
            classifier: None,
            retry_policy: None,
            matcher: None,
            confidence: None,
            runner: None,
            handlers: Vec::new(),
        }
    }

    /// Use one backend for both snapshots and metrics.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: RunSnapshotStore + RunMetricsStore + 'static,
    {
        let snapshots: Arc<dyn RunSnapshotStore> = Arc::clone(&store) as _;
        let metrics: Arc<dyn RunMetricsStore> = store;
        self.snapshot_store(snapshots).metrics_store(metrics)
    }

    pub fn snapshot_store(mut self, store: Arc<dyn RunSnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn metrics_store(mut self, store: Arc<dyn RunMetricsStore>) -> Self {
        self.metrics_store = Some(store);
        self
    }

    pub fn template_provider(mut self, provider: Arc<dyn TemplateProvider>) -> Self {
        self.templates = Some(provider);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn StepPromptDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn DispatchErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn DispatchRetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn turn_matcher(mut self, matcher: Arc<dyn TurnSignalMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn confidence_source(mut self, source: Arc<dyn ConfidenceSource>) -> Self {
        self.confidence = Some(source);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ExecutionRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn handler(mut self, step_id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((step_id.into(), handler));
        self
    }

    /// Validate the configuration and start the background writer.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<RunService> {
        let config = ServiceConfig::from_config(&self.config)?;

        let runner = self.runner.unwrap_or_else(|| Arc::new(NoopRunner));
        let mut engine = Engine::new(Arc::new(ExecutionControls::from_config(
            &self.config,
            runner,
        )));
        for (step_id, handler) in self.handlers {
            engine.register(step_id, handler);
        }

        let retry_policy = self.retry_policy.unwrap_or_else(|| {
            Arc::new(BoundedExponentialDispatchRetryPolicy::new(
                config.retry_initial,
                config.retry_max,
            ))
        });
        let matcher = self
            .matcher
            .unwrap_or_else(|| matcher_for(config.turn_matcher));
        let confidence = self
            .confidence
            .unwrap_or_else(|| Arc::new(FixedConfidence(config.default_confidence)));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(TransientHintClassifier));
        let writer = SnapshotWriter::spawn(
            self.snapshot_store.as_ref().map(Arc::clone),
            self.metrics_store.as_ref().map(Arc::clone),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            config,
            engine,
            table: RwLock::new(RunTable::default()),
            snapshots: self.snapshot_store,
            metrics_store: self.metrics_store,
            templates: self.templates,
            dispatcher: self.dispatcher,
            classifier,
            matcher,
            confidence,
            scheduler: DispatchRetryScheduler::new(
                retry_policy,
                Arc::new(RetryDriver {
                    inner: Weak::clone(weak),
                }),
            ),
            writer,
        });
        Ok(RunService { inner })
    }
}

// --- Service ---

#[derive(Default)]
struct RunTable {
    runs: HashMap<Id, RunSnapshot>,
    dismissed: HashMap<Id, DismissedRunRecord>,
    metrics: RunMetrics,
    replays: ReplayLedger,
}

/// Per-run replay guards: applied decision receipts and consumed turn ids.
#[derive(Default)]
struct ReplayLedger {
    /// `decision_id:action` pairs already applied.
    receipts: HashMap<Id, HashSet<String>>,
    turns: HashMap<Id, HashSet<String>>,
}

impl ReplayLedger {
    fn applied(&self, run_id: &Id, receipt: &str) -> bool {
        self.receipts
            .get(run_id)
            .is_some_and(|r| r.contains(receipt))
    }

    fn consumed(&self, run_id: &Id, turn_id: &str) -> bool {
        self.turns.get(run_id).is_some_and(|t| t.contains(turn_id))
    }

    /// Drop guards a run can no longer need. Completed runs accept no turns;
    /// dismissed runs accept nothing.
    fn settle(&mut self, run: &WorkflowRun) {
        if run.dismissed_at.is_some() {
            self.receipts.remove(&run.id);
            self.turns.remove(&run.id);
        } else if run.status == RunStatus::Completed {
            self.turns.remove(&run.id);
        }
    }
}

struct Inner {
    config: ServiceConfig,
    engine: Engine,
    table: RwLock<RunTable>,
    snapshots: Option<Arc<dyn RunSnapshotStore>>,
    metrics_store: Option<Arc<dyn RunMetricsStore>>,
    templates: Option<Arc<dyn TemplateProvider>>,
    dispatcher: Option<Arc<dyn StepPromptDispatcher>>,
    classifier: Arc<dyn DispatchErrorClassifier>,
    matcher: Arc<dyn TurnSignalMatcher>,
    confidence: Arc<dyn ConfidenceSource>,
    scheduler: DispatchRetryScheduler,
    writer: SnapshotWriter,
}

/// Scheduler callback; holds the service weakly so retry tasks never keep it alive.
struct RetryDriver {
    inner: Weak<Inner>,
}

#[async_trait]
impl DispatchRetryAttempt for RetryDriver {
    async fn attempt(&self, run_id: &Id, attempt: u32) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return true;
        };
        RunService { inner }.retry_dispatch(run_id, attempt).await
    }
}

/// What one drive of a run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Idle,
    CheckpointPaused,
    Advanced,
    Dispatched,
    Deferred,
    Completed,
}

/// Lengths of the append-only run logs before a mutation.
struct Marks {
    audit: usize,
    decisions: usize,
}

impl Marks {
    fn of(run: &WorkflowRun) -> Self {
        Self {
            audit: run.audit.len(),
            decisions: run.decisions.len(),
        }
    }
}

#[derive(Clone)]
pub struct RunService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService")
            .field("config", &self.inner.config)
            .field("engine", &self.inner.engine)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

impl RunService {
    pub fn builder(config: Config) -> RunServiceBuilder {
        RunServiceBuilder::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.workflows_enabled
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(ServiceError::Disabled)
        }
    }

    /// Resolved template catalog.
    ///
    /// A provider that returns nothing falls back to the built-ins unless it
    /// reports itself explicitly configured.
    pub async fn list_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        let Some(provider) = &self.inner.templates else {
            return Ok(builtin_templates());
        };
        let templates = provider.list_workflow_templates().await?;
        if !templates.is_empty() || provider.is_configured().await {
            return Ok(templates);
        }
        Ok(builtin_templates())
    }

    pub async fn create_run(&self, request: CreateRunRequest) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let workspace_id = request.workspace_id.trim();
        if workspace_id.is_empty() {
            return Err(ServiceError::MissingContext("workspace_id"));
        }
        let worktree_id = request.worktree_id.trim();
        if worktree_id.is_empty() {
            return Err(ServiceError::MissingContext("worktree_id"));
        }

        let template = self
            .list_templates()
            .await?
            .into_iter()
            .find(|t| t.id == request.template_id)
            .ok_or_else(|| ServiceError::TemplateNotFound(request.template_id.clone()))?;
        let policy = match &request.policy {
            Some(overrides) => self.inner.config.base_policy.merged(overrides)?,
            None => self.inner.config.base_policy.clone(),
        };

        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let max = self.inner.config.max_active_runs;
        if max > 0 {
            let active = table.runs.values().filter(|s| s.run.is_active()).count();
            if active >= max {
                warn!(active, max, "active run limit reached");
                return Err(ServiceError::RunLimitExceeded(max));
            }
        }

        let now = Utc::now();
        let context = RunContext {
            workspace_id: workspace_id.to_string(),
            worktree_id: worktree_id.to_string(),
            session_id: request.session_id,
            task_id: request.task_id,
            user_prompt: request.user_prompt,
        };
        let mut snapshot = RunSnapshot::new(WorkflowRun::instantiate(
            Id::new(),
            &template,
            context,
            policy,
            now,
        ));
        let marks = Marks::of(&snapshot.run);
        snapshot.run.push_audit(RunAuditEntry {
            at: now,
            action: "run_created".to_string(),
            actor: ACTOR_USER.to_string(),
            from_status: None,
            to_status: Some(RunStatus::Created),
            phase_id: None,
            step_id: None,
            detail: format!("template {}", template.id),
        });
        snapshot.record(
            TimelineEventKind::RunCreated,
            None,
            None,
            format!("run created from template {}", template.name),
            now,
        );
        info!(
            run_id = %snapshot.run.id,
            template_id = %template.id,
            workspace_id = %workspace_id,
            "run created"
        );

        let run = snapshot.run.clone();
        self.commit(&mut table.metrics, &mut table.replays, &snapshot, &marks);
        table.runs.insert(run.id.clone(), snapshot);
        Ok(run)
    }

    pub async fn start_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;
        require_status(snapshot, "start", &[RunStatus::Created])?;

        let marks = Marks::of(&snapshot.run);
        transition(
            snapshot,
            "run_started",
            ACTOR_USER,
            RunStatus::Running,
            TimelineEventKind::RunStarted,
            "run started",
            Utc::now(),
        );
        info!(run_id = %run_id, "run started");

        let driven = self.drive(snapshot).await;
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        driven.map(|_| snapshot.run.clone())
    }

    pub async fn pause_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;
        require_status(snapshot, "pause", &[RunStatus::Running])?;

        let marks = Marks::of(&snapshot.run);
        transition(
            snapshot,
            "run_paused",
            ACTOR_USER,
            RunStatus::Paused,
            TimelineEventKind::RunPaused,
            "run paused",
            Utc::now(),
        );
        info!(run_id = %run_id, "run paused");

        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        Ok(snapshot.run.clone())
    }

    /// Resume a paused run. Resuming at an unanswered policy checkpoint clears it.
    pub async fn resume_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;
        require_status(snapshot, "resume", &[RunStatus::Paused])?;

        let marks = Marks::of(&snapshot.run);
        let run = &snapshot.run;
        let unanswered = run
            .latest_decision
            .as_ref()
            .filter(|d| d.decision == CheckpointAction::Pause.as_str())
            .map(|d| format!("{}/{}", d.phase_id, d.step_id));
        let next = run.next_pending_position().map(|p| clearance_key(run, p));
        if unanswered.is_some() && unanswered == next {
            snapshot.run.checkpoint_clearance = next;
        }
        transition(
            snapshot,
            "run_resumed",
            ACTOR_USER,
            RunStatus::Running,
            TimelineEventKind::RunResumed,
            "run resumed",
            Utc::now(),
        );
        info!(run_id = %run_id, "run resumed");

        let driven = self.drive(snapshot).await;
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        driven.map(|_| snapshot.run.clone())
    }

    /// Reset the failed (or interrupted) steps of a failed run and re-drive it.
    pub async fn resume_failed_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;
        require_status(snapshot, "resume after failure", &[RunStatus::Failed])?;

        let marks = Marks::of(&snapshot.run);
        for phase in &mut snapshot.run.phases {
            let mut touched = phase.status == PhaseStatus::Failed;
            for step in &mut phase.steps {
                if matches!(step.status, StepStatus::Failed | StepStatus::Running) {
                    step.reset();
                    touched = true;
                }
            }
            if touched {
                let started = phase
                    .steps
                    .iter()
                    .any(|s| s.status == StepStatus::Completed);
                phase.status = if started {
                    PhaseStatus::Running
                } else {
                    PhaseStatus::Pending
                };
                phase.completed_at = None;
            }
        }
        snapshot.run.last_error = None;
        if let Some(position) = snapshot.run.next_pending_position() {
            snapshot.run.set_position(position);
        }
        transition(
            snapshot,
            "run_resumed_after_failure",
            ACTOR_USER,
            RunStatus::Running,
            TimelineEventKind::RunResumed,
            "run resumed after failure",
            Utc::now(),
        );
        info!(run_id = %run_id, "failed run resumed");

        let driven = self.drive(snapshot).await;
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        driven.map(|_| snapshot.run.clone())
    }

    /// Process the next step of a running run.
    pub async fn advance_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;
        require_status(snapshot, "advance", &[RunStatus::Running])?;
        if snapshot.run.awaiting_position().is_some() {
            return Err(ServiceError::InvalidTransition {
                action: "advance while a turn is pending".to_string(),
                status: snapshot.run.status,
            });
        }

        let marks = Marks::of(&snapshot.run);
        let driven = self.drive(snapshot).await;
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        driven.map(|_| snapshot.run.clone())
    }

    /// Apply a checkpoint decision. Replays of an applied
    /// `(run, decision_id, action)` return the current run unchanged;
    /// requests without a decision id are always applied.
    pub async fn handle_decision(
        &self,
        run_id: &Id,
        request: DecisionRequest,
    ) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let snapshot = lookup(&mut table.runs, run_id)?;

        // Only decisions that name their target can be recognized as replays.
        let receipt = request
            .decision_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("{id}:{}", request.action));
        if let Some(receipt) = receipt.as_ref().filter(|r| table.replays.applied(run_id, r)) {
            debug!(run_id = %run_id, receipt = %receipt, "decision already applied");
            return Ok(snapshot.run.clone());
        }

        let Some(action) = DecisionAction::parse(&request.action) else {
            return Err(ServiceError::InvalidTransition {
                action: request.action,
                status: snapshot.run.status,
            });
        };
        let allowed: &[RunStatus] = match action {
            DecisionAction::ApproveContinue => &[RunStatus::Paused],
            DecisionAction::RequestRevision => &[RunStatus::Running, RunStatus::Paused],
            DecisionAction::PauseRun => &[RunStatus::Running],
        };
        require_status(snapshot, action.as_str(), allowed)?;

        let marks = Marks::of(&snapshot.run);
        let now = Utc::now();
        let pause = unanswered_pause(&snapshot.run).cloned();
        let position = snapshot.run.next_pending_position();
        let (phase_id, step_id) = position
            .map(|p| position_ids(&snapshot.run, p))
            .or_else(|| pause.as_ref().map(|d| (d.phase_id.clone(), d.step_id.clone())))
            .unwrap_or_default();
        let metadata = match &pause {
            Some(pause) => pause.metadata.clone(),
            None => self.evaluate(&snapshot.run, &phase_id, &step_id, now),
        };
        let note = request
            .note
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| action.as_str().replace('_', " "));

        snapshot.run.record_decision(CheckpointDecision {
            id: snapshot.run.next_decision_id(),
            run_id: run_id.clone(),
            phase_id,
            step_id,
            decision: action.as_str().to_string(),
            reason: note.clone(),
            source: DecisionSource::User,
            requested_at: pause.as_ref().map_or(now, |p| p.requested_at),
            decided_at: Some(now),
            metadata,
        });

        let driven = match action {
            DecisionAction::ApproveContinue => {
                if let Some(pause) = &pause {
                    if self.inner.config.telemetry_enabled {
                        let latency = (now - pause.requested_at).num_milliseconds().max(0);
                        table
                            .metrics
                            .record_approval(u64::try_from(latency).unwrap_or_default());
                    }
                }
                snapshot.run.checkpoint_clearance =
                    position.map(|p| clearance_key(&snapshot.run, p));
                transition(
                    snapshot,
                    "checkpoint_approved",
                    ACTOR_USER,
                    RunStatus::Running,
                    TimelineEventKind::CheckpointApproved,
                    &note,
                    now,
                );
                info!(run_id = %run_id, "checkpoint approved");
                self.drive(snapshot).await.map(|_| ())
            }
            DecisionAction::RequestRevision => {
                snapshot.run.checkpoint_clearance = None;
                transition(
                    snapshot,
                    "revision_requested",
                    ACTOR_USER,
                    RunStatus::Paused,
                    TimelineEventKind::RevisionRequested,
                    &note,
                    now,
                );
                info!(run_id = %run_id, "revision requested");
                Ok(())
            }
            DecisionAction::PauseRun => {
                transition(
                    snapshot,
                    "run_paused",
                    ACTOR_USER,
                    RunStatus::Paused,
                    TimelineEventKind::RunPaused,
                    &note,
                    now,
                );
                info!(run_id = %run_id, "run paused by decision");
                Ok(())
            }
        };

        if let Some(receipt) = receipt {
            table
                .replays
                .receipts
                .entry(run_id.clone())
                .or_default()
                .insert(receipt);
        }
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        driven.map(|()| snapshot.run.clone())
    }

    /// Hide a run from listings. Running runs must be paused first.
    pub async fn dismiss_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        self.ensure_enabled()?;
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let Some(snapshot) = table.runs.get_mut(run_id) else {
            return table
                .dismissed
                .get(run_id)
                .map(DismissedRunRecord::tombstone)
                .ok_or_else(|| ServiceError::RunNotFound(run_id.clone()));
        };
        if snapshot.run.dismissed_at.is_some() {
            return Ok(snapshot.run.clone());
        }
        if snapshot.run.status == RunStatus::Running {
            return Err(ServiceError::InvalidTransition {
                action: "dismiss".to_string(),
                status: snapshot.run.status,
            });
        }

        let marks = Marks::of(&snapshot.run);
        let now = Utc::now();
        snapshot.run.dismissed_at = Some(now);
        snapshot.run.push_audit(RunAuditEntry {
            at: now,
            action: "run_dismissed".to_string(),
            actor: ACTOR_USER.to_string(),
            from_status: None,
            to_status: None,
            phase_id: None,
            step_id: None,
            detail: String::new(),
        });
        snapshot.record(
            TimelineEventKind::RunDismissed,
            None,
            None,
            "run dismissed",
            now,
        );
        info!(run_id = %run_id, "run dismissed");

        let record = DismissedRunRecord::from_run(&snapshot.run, now);
        self.inner.writer.upsert_dismissed(record.clone());
        table.dismissed.insert(run_id.clone(), record);
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        Ok(snapshot.run.clone())
    }

    /// Apply a turn-completion signal to every run it matches.
    /// Returns the runs that changed.
    pub async fn on_turn_completed(&self, signal: &TurnSignal) -> Result<Vec<WorkflowRun>> {
        self.ensure_enabled()?;
        if signal.session_id.trim().is_empty() {
            debug!(
                workspace_id = %signal.workspace_id,
                "turn signal without session id, nothing to match"
            );
            return Ok(Vec::new());
        }

        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let mut candidates: Vec<Id> = table
            .runs
            .values()
            .filter(|s| accepts_turns(&s.run) && self.inner.matcher.matches(&s.run, signal))
            .map(|s| s.run.id.clone())
            .collect();
        candidates.sort();

        let turn_id = signal.dedup_key();
        let mut updated = Vec::new();
        for run_id in candidates {
            if let Some(turn_id) = turn_id {
                if table.replays.consumed(&run_id, turn_id) {
                    debug!(run_id = %run_id, turn_id = %turn_id, "turn already consumed");
                    continue;
                }
            }
            let Some(snapshot) = table.runs.get_mut(&run_id) else {
                continue;
            };
            let Some(position) = snapshot.run.awaiting_position() else {
                continue;
            };

            let marks = Marks::of(&snapshot.run);
            let now = Utc::now();
            let (phase_id, step_id) = position_ids(&snapshot.run, position);
            let expected = snapshot.run.step(position).and_then(|s| s.turn_id.clone());

            if let Some(expected) = expected.filter(|e| turn_id != Some(e.as_str())) {
                let detail = format!(
                    "expected turn {expected}, got {}",
                    turn_id.unwrap_or("none")
                );
                warn!(run_id = %run_id, step_id = %step_id, detail = %detail, "turn signal ignored");
                snapshot.run.audit_step(
                    "turn_ignored",
                    ACTOR_SYSTEM,
                    &phase_id,
                    Some(&step_id),
                    detail.clone(),
                    now,
                );
                snapshot.record(
                    TimelineEventKind::TurnIgnored,
                    Some(&phase_id),
                    Some(&step_id),
                    detail,
                    now,
                );
                self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
                continue;
            }

            if let Some(turn_id) = turn_id {
                table
                    .replays
                    .turns
                    .entry(run_id.clone())
                    .or_default()
                    .insert(turn_id.to_string());
            }
            snapshot.record(
                TimelineEventKind::TurnCompleted,
                Some(&phase_id),
                Some(&step_id),
                format!("turn {} completed", turn_id.unwrap_or("-")),
                now,
            );

            if signal.is_failure() {
                engine::fail_step(snapshot, position, &signal.failure_detail(), now);
            } else {
                let outcome = StepOutcome {
                    outcome: signal
                        .status
                        .clone()
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or_else(|| "completed".to_string()),
                    output: None,
                };
                engine::complete_step(snapshot, position, &outcome, now);
                info!(run_id = %run_id, step_id = %step_id, "turn completed step");
                if let Err(e) = self.drive(snapshot).await {
                    warn!(run_id = %run_id, error = %e, "advance after turn completion failed");
                }
            }

            self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
            updated.push(snapshot.run.clone());
        }
        Ok(updated)
    }

    /// Run or its tombstone.
    pub async fn get_run(&self, run_id: &Id) -> Result<WorkflowRun> {
        let table = self.inner.table.read().await;
        if let Some(snapshot) = table.runs.get(run_id) {
            return Ok(snapshot.run.clone());
        }
        table
            .dismissed
            .get(run_id)
            .map(DismissedRunRecord::tombstone)
            .ok_or_else(|| ServiceError::RunNotFound(run_id.clone()))
    }

    /// Runs ordered by creation time.
    pub async fn list_runs(&self, filter: &RunListFilter) -> Vec<WorkflowRun> {
        let table = self.inner.table.read().await;
        let in_workspace = |workspace_id: &str| match &filter.workspace_id {
            Some(wanted) => wanted == workspace_id,
            None => true,
        };

        let mut runs: Vec<WorkflowRun> = table
            .runs
            .values()
            .map(|s| &s.run)
            .filter(|r| filter.include_dismissed || r.dismissed_at.is_none())
            .filter(|r| in_workspace(&r.workspace_id))
            .cloned()
            .collect();
        if filter.include_dismissed {
            runs.extend(
                table
                    .dismissed
                    .values()
                    .filter(|d| !table.runs.contains_key(&d.run_id))
                    .filter(|d| in_workspace(&d.workspace_id))
                    .map(DismissedRunRecord::tombstone),
            );
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    pub async fn get_run_timeline(&self, run_id: &Id) -> Result<Vec<RunTimelineEvent>> {
        let table = self.inner.table.read().await;
        if let Some(snapshot) = table.runs.get(run_id) {
            return Ok(snapshot.timeline.clone());
        }
        if table.dismissed.contains_key(run_id) {
            return Ok(Vec::new());
        }
        Err(ServiceError::RunNotFound(run_id.clone()))
    }

    /// Aggregate counters; all zero when telemetry is off.
    pub async fn metrics(&self) -> RunMetrics {
        if !self.inner.config.telemetry_enabled {
            return RunMetrics::default();
        }
        self.inner.table.read().await.metrics.clone()
    }

    /// Zero the counters. With telemetry off only a forced reset is persisted.
    pub async fn reset_metrics(&self, force: bool) -> RunMetrics {
        if !self.inner.config.telemetry_enabled && !force {
            return RunMetrics::default();
        }
        let mut table = self.inner.table.write().await;
        table.metrics = RunMetrics::default();
        self.inner.writer.save_metrics(RunMetrics::default());
        info!(force, "metrics reset");
        RunMetrics::default()
    }

    /// Load persisted state. Runs that were created or running when the
    /// process stopped are failed, since their turns can no longer arrive.
    /// Returns how many runs were interrupted.
    pub async fn recover(&self) -> Result<usize> {
        let Some(store) = &self.inner.snapshots else {
            return Ok(0);
        };
        let snapshots = store.list_workflow_runs().await?;
        let dismissed = store.list_dismissed_runs().await?;
        let metrics = match &self.inner.metrics_store {
            Some(store) => store.load_metrics().await?,
            None => None,
        };

        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        if let Some(metrics) = metrics.filter(|_| self.inner.config.telemetry_enabled) {
            table.metrics = metrics;
        }
        for record in dismissed {
            table.dismissed.insert(record.run_id.clone(), record);
        }

        let mut interrupted = 0;
        for mut snapshot in snapshots {
            if matches!(snapshot.run.status, RunStatus::Created | RunStatus::Running) {
                let marks = Marks::of(&snapshot.run);
                let now = Utc::now();
                match snapshot.run.awaiting_position() {
                    Some(position) => {
                        engine::fail_step(&mut snapshot, position, INTERRUPTED_BY_RESTART, now);
                    }
                    None => engine::fail_run(&mut snapshot, INTERRUPTED_BY_RESTART, now),
                }
                self.commit(&mut table.metrics, &mut table.replays, &snapshot, &marks);
                interrupted += 1;
            }
            table.runs.insert(snapshot.run.id.clone(), snapshot);
        }

        info!(
            runs = table.runs.len(),
            dismissed = table.dismissed.len(),
            interrupted,
            "recovered workflow runs"
        );
        Ok(interrupted)
    }

    /// Wait for queued snapshot writes.
    pub async fn flush(&self) {
        self.inner.writer.flush().await;
    }

    /// Stop retry tasks and flush writes.
    pub async fn close(&self) {
        self.inner.scheduler.close().await;
        self.flush().await;
        info!("run service closed");
    }

    /// Whether a deferred dispatch retry is pending for `run_id`.
    pub fn retry_scheduled(&self, run_id: &Id) -> bool {
        self.inner.scheduler.is_scheduled(run_id)
    }

    // --- Driving ---

    /// Make one unit of progress on a running run: checkpoint, then dispatch
    /// or execute the next pending step.
    async fn drive(&self, snapshot: &mut RunSnapshot) -> Result<Progress> {
        if snapshot.run.status != RunStatus::Running || snapshot.run.awaiting_position().is_some()
        {
            return Ok(Progress::Idle);
        }
        let Some(position) = snapshot.run.next_pending_position() else {
            self.inner.engine.advance(snapshot).await?;
            return Ok(Progress::Completed);
        };

        let key = clearance_key(&snapshot.run, position);
        if snapshot.run.checkpoint_clearance.as_deref() != Some(key.as_str())
            && self.checkpoint(snapshot, position)
        {
            return Ok(Progress::CheckpointPaused);
        }

        let step = &snapshot.run.phases[position.0].steps[position.1];
        let dispatcher = self.inner.dispatcher.as_ref().filter(|_| {
            !step.prompt.trim().is_empty() && !self.inner.engine.handles_locally(&step.id)
        });
        let result = match dispatcher {
            Some(dispatcher) => {
                self.dispatch_step(dispatcher.as_ref(), snapshot, position)
                    .await
            }
            None => match self.inner.engine.advance(snapshot).await {
                Ok(Advanced::RunCompleted) => Ok(Progress::Completed),
                Ok(Advanced::Step { .. }) => Ok(Progress::Advanced),
                Err(e) => Err(e.into()),
            },
        };

        let left_pending = snapshot
            .run
            .step(position)
            .is_some_and(|s| s.status != StepStatus::Pending);
        if left_pending && snapshot.run.checkpoint_clearance.as_deref() == Some(key.as_str()) {
            snapshot.run.checkpoint_clearance = None;
        }

        match result {
            Err(ServiceError::StepDispatchDeferred(_)) => {
                self.inner.scheduler.enqueue(&snapshot.run.id);
                Ok(Progress::Deferred)
            }
            other => other,
        }
    }

    fn evaluate(
        &self,
        run: &WorkflowRun,
        phase_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> CheckpointDecisionMetadata {
        let input = checkpoint::default_input(self.inner.confidence.as_ref(), run, phase_id, step_id);
        policy::evaluate(&run.policy, &input, now)
    }

    /// Evaluate the checkpoint in front of `position`; pause the run if it says so.
    fn checkpoint(&self, snapshot: &mut RunSnapshot, position: (usize, usize)) -> bool {
        let now = Utc::now();
        let (phase_id, step_id) = position_ids(&snapshot.run, position);
        let metadata = self.evaluate(&snapshot.run, &phase_id, &step_id, now);
        if metadata.action == CheckpointAction::Continue {
            debug!(
                run_id = %snapshot.run.id,
                step_id = %step_id,
                score = metadata.score,
                "checkpoint passed"
            );
            return false;
        }

        let summary = metadata.summary();
        info!(
            run_id = %snapshot.run.id,
            step_id = %step_id,
            severity = metadata.severity.as_str(),
            score = metadata.score,
            "checkpoint paused run"
        );
        snapshot.run.set_position(position);
        snapshot.run.record_decision(CheckpointDecision {
            id: snapshot.run.next_decision_id(),
            run_id: snapshot.run.id.clone(),
            phase_id: phase_id.clone(),
            step_id: step_id.clone(),
            decision: CheckpointAction::Pause.as_str().to_string(),
            reason: summary.clone(),
            source: DecisionSource::Policy,
            requested_at: now,
            decided_at: None,
            metadata,
        });
        let from = snapshot.run.status;
        snapshot.run.status = RunStatus::Paused;
        snapshot.run.push_audit(RunAuditEntry {
            at: now,
            action: "checkpoint_paused".to_string(),
            actor: ACTOR_POLICY.to_string(),
            from_status: Some(from),
            to_status: Some(RunStatus::Paused),
            phase_id: Some(phase_id.clone()),
            step_id: Some(step_id.clone()),
            detail: summary.clone(),
        });
        snapshot.record(
            TimelineEventKind::CheckpointPaused,
            Some(&phase_id),
            Some(&step_id),
            summary,
            now,
        );
        true
    }

    async fn dispatch_step(
        &self,
        dispatcher: &dyn StepPromptDispatcher,
        snapshot: &mut RunSnapshot,
        position: (usize, usize),
    ) -> Result<Progress> {
        let run = &snapshot.run;
        let phase = &run.phases[position.0];
        let step = &phase.steps[position.1];
        let request = StepDispatchRequest {
            run_id: run.id.clone(),
            template_id: run.template.id.clone(),
            workspace_id: run.workspace_id.clone(),
            worktree_id: run.worktree_id.clone(),
            session_id: run.session_id.clone(),
            phase_id: phase.id.clone(),
            step_id: step.id.clone(),
            prompt: step.prompt.clone(),
            runtime_options: step.runtime_options.clone(),
        };
        let attempt = u32::try_from(step.execution_attempts.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);

        let result = dispatcher.dispatch(&request).await;
        let now = Utc::now();
        let phase_id = request.phase_id.as_str();
        let step_id = request.step_id.as_str();

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                let class = self.inner.classifier.classify(&err);
                if class == DispatchErrorClass::Deferred {
                    warn!(run_id = %request.run_id, step_id = %step_id, error = %err, "step dispatch deferred");
                    if let Some(step) = snapshot.run.step_mut(position) {
                        step.execution_state = ExecutionState::Deferred;
                        step.error = Some(err.message.clone());
                    }
                    snapshot.record(
                        TimelineEventKind::StepDispatchDeferred,
                        Some(phase_id),
                        Some(step_id),
                        format!("dispatch deferred: {}", err.message),
                        now,
                    );
                    return Err(ServiceError::StepDispatchDeferred(err.message));
                }
                warn!(
                    run_id = %request.run_id,
                    step_id = %step_id,
                    class = class.as_str(),
                    error = %err,
                    "step dispatch failed"
                );
                engine::fail_step(
                    snapshot,
                    position,
                    &format!("step dispatch failed: {}", err.message),
                    now,
                );
                return Err(ServiceError::StepDispatchFatal(err.message));
            }
        };

        let session_id = result
            .session_id
            .clone()
            .filter(|s| result.dispatched && !s.is_empty());
        let Some(session_id) = session_id else {
            let detail = if result.dispatched {
                "dispatcher returned no session id"
            } else {
                "dispatcher did not dispatch the step"
            };
            warn!(run_id = %request.run_id, step_id = %step_id, detail, "step dispatch unavailable");
            if let Some(step) = snapshot.run.step_mut(position) {
                step.execution_state = ExecutionState::Unavailable;
            }
            engine::fail_step(snapshot, position, detail, now);
            return Err(ServiceError::StepDispatchUnavailable(detail.to_string()));
        };

        engine::start_step(snapshot, position, now);
        let trace_id = format!("{}:{phase_id}:{step_id}:attempt-{attempt}", request.run_id);
        let turn_id = result.turn_id.clone().filter(|t| !t.is_empty());
        let execution = ExecutionRef {
            trace_id: trace_id.clone(),
            session_id: session_id.clone(),
            turn_id: turn_id.clone(),
            provider: result.provider.clone(),
            model: result.model.clone(),
            prompt: request.prompt.clone(),
            attempt,
            started_at: now,
            completed_at: None,
        };
        if let Some(step) = snapshot.run.step_mut(position) {
            step.attempt = attempt;
            step.awaiting_turn = true;
            step.turn_id = turn_id;
            step.execution_state = ExecutionState::Linked;
            step.execution_attempts.push(execution.clone());
            step.execution = Some(execution);
        }
        if snapshot.run.session_id.is_none() {
            snapshot.run.session_id = Some(session_id.clone());
        }
        snapshot.record(
            TimelineEventKind::StepDispatched,
            Some(phase_id),
            Some(step_id),
            format!("dispatched as {trace_id}"),
            now,
        );
        info!(
            run_id = %request.run_id,
            step_id = %step_id,
            session_id = %session_id,
            attempt,
            "step dispatched"
        );
        Ok(Progress::Dispatched)
    }

    /// Scheduler callback. Returns `true` when no more retries are needed.
    async fn retry_dispatch(&self, run_id: &Id, attempt: u32) -> bool {
        let mut guard = self.inner.table.write().await;
        let table = &mut *guard;
        let Some(snapshot) = table.runs.get_mut(run_id) else {
            return true;
        };
        let run = &snapshot.run;
        let deferred = run
            .next_pending_position()
            .and_then(|p| run.step(p))
            .is_some_and(|s| s.execution_state == ExecutionState::Deferred);
        if !deferred || run.status != RunStatus::Running || run.dismissed_at.is_some() {
            debug!(run_id = %run_id, status = %run.status, "no deferred dispatch left");
            return true;
        }

        let marks = Marks::of(&snapshot.run);
        let driven = self.drive(snapshot).await;
        self.commit(&mut table.metrics, &mut table.replays, snapshot, &marks);
        match driven {
            Ok(Progress::Deferred) => false,
            Ok(progress) => {
                debug!(run_id = %run_id, attempt, progress = ?progress, "deferred dispatch resolved");
                true
            }
            Err(e) => {
                warn!(run_id = %run_id, attempt, error = %e, "dispatch retry failed the run");
                true
            }
        }
    }

    /// Count what changed since `marks` and queue the snapshot write.
    fn commit(
        &self,
        metrics: &mut RunMetrics,
        replays: &mut ReplayLedger,
        snapshot: &RunSnapshot,
        marks: &Marks,
    ) {
        replays.settle(&snapshot.run);
        if self.inner.config.telemetry_enabled {
            tally(metrics, &snapshot.run, marks);
            self.inner.writer.save_metrics(metrics.clone());
        }
        self.inner.writer.upsert_run(snapshot.clone());
    }
}

// --- Helpers ---

fn lookup<'a>(runs: &'a mut HashMap<Id, RunSnapshot>, run_id: &Id) -> Result<&'a mut RunSnapshot> {
    runs.get_mut(run_id)
        .ok_or_else(|| ServiceError::RunNotFound(run_id.clone()))
}

fn require_status(snapshot: &RunSnapshot, action: &str, allowed: &[RunStatus]) -> Result<()> {
    let run = &snapshot.run;
    if run.dismissed_at.is_none() && allowed.contains(&run.status) {
        return Ok(());
    }
    Err(ServiceError::InvalidTransition {
        action: action.to_string(),
        status: run.status,
    })
}

fn transition(
    snapshot: &mut RunSnapshot,
    action: &str,
    actor: &str,
    to: RunStatus,
    kind: TimelineEventKind,
    message: &str,
    now: DateTime<Utc>,
) {
    let from = snapshot.run.status;
    snapshot.run.status = to;
    snapshot
        .run
        .audit_transition(action, actor, from, to, message, now);
    snapshot.record(kind, None, None, message, now);
}

fn position_ids(run: &WorkflowRun, position: (usize, usize)) -> (String, String) {
    let phase = &run.phases[position.0];
    (phase.id.clone(), phase.steps[position.1].id.clone())
}

fn clearance_key(run: &WorkflowRun, position: (usize, usize)) -> String {
    let (phase_id, step_id) = position_ids(run, position);
    format!("{phase_id}/{step_id}")
}

/// Policy pause that no later decision has answered.
fn unanswered_pause(run: &WorkflowRun) -> Option<&CheckpointDecision> {
    run.latest_decision
        .as_ref()
        .filter(|d| d.source == DecisionSource::Policy && d.decision == CheckpointAction::Pause.as_str())
}

/// Fold audit entries and decisions appended since `marks` into the counters.
fn tally(metrics: &mut RunMetrics, run: &WorkflowRun, marks: &Marks) {
    for entry in run.audit.iter().skip(marks.audit) {
        if let (Some(from), Some(to)) = (entry.from_status, entry.to_status) {
            metrics.observe_transition(from, to);
        }
        match entry.action.as_str() {
            "run_paused" => metrics.record_intervention("manual_pause"),
            "revision_requested" => metrics.record_intervention("revision_requested"),
            "capability_denied" => metrics.record_intervention("capability_denied"),
            _ => {}
        }
    }
    for decision in run.decisions.iter().skip(marks.decisions) {
        if decision.source == DecisionSource::Policy {
            for reason in &decision.metadata.reasons {
                metrics.record_intervention(reason.code.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_actions_parse() {
        for action in [
            DecisionAction::ApproveContinue,
            DecisionAction::RequestRevision,
            DecisionAction::PauseRun,
        ] {
            assert_eq!(DecisionAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(DecisionAction::parse("skip"), None);
    }

    #[test]
    fn service_config_rejects_zero_attempts() {
        let config = Config {
            command_max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            ServiceConfig::from_config(&config),
            Err(ServiceError::Config(ConfigError::InvalidNumber { .. }))
        ));
    }

    #[test]
    fn service_config_rejects_out_of_range_thresholds() {
        let config = Config {
            pause_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(ServiceConfig::from_config(&config).is_err());

        let config = Config {
            default_confidence: -0.1,
            ..Default::default()
        };
        assert!(matches!(
            ServiceConfig::from_config(&config),
            Err(ServiceError::Policy(PolicyError::ThresholdOutOfRange { .. }))
        ));
    }

    #[test]
    fn service_config_rejects_inverted_backoff() {
        let config = Config {
            dispatch_retry_initial_ms: 500,
            dispatch_retry_max_ms: 100,
            ..Default::default()
        };
        assert!(ServiceConfig::from_config(&config).is_err());
    }

    #[test]
    fn engine_not_running_maps_to_invalid_transition() {
        let err: ServiceError = EngineError::NotRunning {
            run_id: Id::new(),
            status: RunStatus::Paused,
        }
        .into();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                status: RunStatus::Paused,
                ..
            }
        ));
    }

    fn solid_request() -> CreateRunRequest {
        CreateRunRequest {
            template_id: guide_core::templates::SOLID_PHASE_DELIVERY.to_string(),
            workspace_id: "ws-1".to_string(),
            worktree_id: "wt-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dismissal_drops_replay_guards() {
        let service = RunService::builder(Config::default()).build().unwrap();
        let run = service.create_run(solid_request()).await.unwrap();
        service.start_run(&run.id).await.unwrap();

        let pause = DecisionRequest {
            action: "pause_run".to_string(),
            decision_id: Some("ui-1".to_string()),
            note: None,
        };
        service.handle_decision(&run.id, pause).await.unwrap();
        assert!(service
            .inner
            .table
            .read()
            .await
            .replays
            .applied(&run.id, "ui-1:pause_run"));

        service.dismiss_run(&run.id).await.unwrap();
        let table = service.inner.table.read().await;
        assert!(!table.replays.receipts.contains_key(&run.id));
        assert!(!table.replays.turns.contains_key(&run.id));
    }

    #[tokio::test]
    async fn completed_runs_drop_consumed_turns_but_keep_receipts() {
        let service = RunService::builder(Config::default()).build().unwrap();
        let mut run = service.create_run(solid_request()).await.unwrap();

        let mut ledger = ReplayLedger::default();
        ledger
            .receipts
            .entry(run.id.clone())
            .or_default()
            .insert("d-1:approve_continue".to_string());
        ledger
            .turns
            .entry(run.id.clone())
            .or_default()
            .insert("turn-1".to_string());

        run.status = RunStatus::Failed;
        ledger.settle(&run);
        assert!(ledger.consumed(&run.id, "turn-1"));

        run.status = RunStatus::Completed;
        ledger.settle(&run);
        assert!(!ledger.consumed(&run.id, "turn-1"));
        assert!(ledger.applied(&run.id, "d-1:approve_continue"));
    }
}
