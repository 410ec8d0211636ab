//! Turn-completion signals and run matching.

use std::sync::Arc;

use guide_core::config::TurnMatcherKind;
use guide_core::{RunStatus, WorkflowRun};
use serde::{Deserialize, Serialize};

/// Terminal statuses that mark a turn as failed.
const FAILED_STATUSES: &[&str] = &[
    "failed",
    "error",
    "interrupted",
    "cancelled",
    "rejected",
    "aborted",
    "stopped",
];

/// Pushed by the external turn-completion notifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSignal {
    pub session_id: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub turn_id: Option<String>,
    pub terminal: bool,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl TurnSignal {
    pub fn is_failure(&self) -> bool {
        if self.error.as_deref().is_some_and(|e| !e.trim().is_empty()) {
            return true;
        }
        self.terminal
            && self
                .status
                .as_deref()
                .is_some_and(|s| FAILED_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()))
    }

    /// Human-readable failure text.
    pub fn failure_detail(&self) -> String {
        match (&self.error, &self.status) {
            (Some(error), _) if !error.trim().is_empty() => error.clone(),
            (_, Some(status)) => format!("turn ended with status {status}"),
            _ => "turn failed".to_string(),
        }
    }

    fn turn_id(&self) -> Option<&str> {
        self.turn_id.as_deref().filter(|t| !t.is_empty())
    }

    /// Key used to drop replays of the same turn for a run.
    pub fn dedup_key(&self) -> Option<&str> {
        self.turn_id()
    }
}

/// Decides whether a signal belongs to a run.
pub trait TurnSignalMatcher: Send + Sync {
    fn matches(&self, run: &WorkflowRun, signal: &TurnSignal) -> bool;
}

fn session_matches(run: &WorkflowRun, session_id: &str) -> bool {
    if session_id.is_empty() {
        return false;
    }
    if run.session_id.as_deref() == Some(session_id) {
        return true;
    }
    run.awaiting_position()
        .and_then(|pos| run.step(pos))
        .and_then(|step| step.execution.as_ref())
        .is_some_and(|exec| exec.session_id == session_id)
}

/// Exact session-id match against the run or its awaiting step.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictSessionMatcher;

impl TurnSignalMatcher for StrictSessionMatcher {
    fn matches(&self, run: &WorkflowRun, signal: &TurnSignal) -> bool {
        session_matches(run, &signal.session_id)
    }
}

/// Session match, or workspace and worktree match for runs with no session yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextFallbackMatcher;

impl TurnSignalMatcher for ContextFallbackMatcher {
    fn matches(&self, run: &WorkflowRun, signal: &TurnSignal) -> bool {
        if session_matches(run, &signal.session_id) {
            return true;
        }
        run.session_id.is_none()
            && !signal.workspace_id.is_empty()
            && run.workspace_id == signal.workspace_id
            && run.worktree_id == signal.worktree_id
    }
}

pub fn matcher_for(kind: TurnMatcherKind) -> Arc<dyn TurnSignalMatcher> {
    match kind {
        TurnMatcherKind::Strict => Arc::new(StrictSessionMatcher),
        TurnMatcherKind::ContextFallback => Arc::new(ContextFallbackMatcher),
    }
}

/// Runs that can receive a turn: running or paused with a step awaiting its turn.
pub fn accepts_turns(run: &WorkflowRun) -> bool {
    matches!(run.status, RunStatus::Running | RunStatus::Paused)
        && run.dismissed_at.is_none()
        && run.awaiting_position().is_some()
}
