//! Inputs for the checkpoint evaluated before each step.

use guide_core::policy::EvaluationInput;
use guide_core::templates::COMMIT_STEP;
use guide_core::WorkflowRun;

/// Supplies the agent confidence used for a step's checkpoint.
pub trait ConfidenceSource: Send + Sync {
    fn confidence(&self, run: &WorkflowRun, phase_id: &str, step_id: &str) -> Option<f64>;
}

/// Same confidence for every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedConfidence(pub f64);

impl Default for FixedConfidence {
    fn default() -> Self {
        Self(0.90)
    }
}

impl ConfidenceSource for FixedConfidence {
    fn confidence(&self, _run: &WorkflowRun, _phase_id: &str, _step_id: &str) -> Option<f64> {
        Some(self.0)
    }
}

/// Evaluation input for the checkpoint in front of `step_id`.
pub fn default_input(
    source: &dyn ConfidenceSource,
    run: &WorkflowRun,
    phase_id: &str,
    step_id: &str,
) -> EvaluationInput {
    EvaluationInput {
        confidence: source.confidence(run, phase_id, step_id),
        pre_commit_approval_required: step_id == COMMIT_STEP,
        ..EvaluationInput::default()
    }
}
