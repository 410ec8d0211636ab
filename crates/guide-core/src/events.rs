//! Timeline events for workflow runs.
//!
//! The timeline is observability-only: events are appended and rendered,
//! never parsed back to reconstruct state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Id;

/// Timeline event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    RunCreated,
    RunStarted,
    RunPaused,
    RunResumed,
    RunCompleted,
    RunFailed,
    RunDismissed,
    PhaseStarted,
    PhaseCompleted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepDispatched,
    StepDispatchDeferred,
    CheckpointPaused,
    CheckpointApproved,
    RevisionRequested,
    TurnCompleted,
    TurnIgnored,
}

impl TimelineEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::RunPaused => "run_paused",
            Self::RunResumed => "run_resumed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunDismissed => "run_dismissed",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepDispatched => "step_dispatched",
            Self::StepDispatchDeferred => "step_dispatch_deferred",
            Self::CheckpointPaused => "checkpoint_paused",
            Self::CheckpointApproved => "checkpoint_approved",
            Self::RevisionRequested => "revision_requested",
            Self::TurnCompleted => "turn_completed",
            Self::TurnIgnored => "turn_ignored",
        }
    }
}

impl std::fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTimelineEvent {
    pub id: Id,
    pub run_id: Id,
    pub kind: TimelineEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub message: String,
    pub at: DateTime<Utc>,
}
