//! Checkpoint policy evaluation.
//!
//! `evaluate` is a pure function: it turns a policy and a set of signals
//! into a continue/pause decision with a severity score. Six conditions are
//! checked in a fixed order; each one that holds and is gated (hard or
//! conditional) contributes a reason and a weight to an additive score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WEIGHT_AMBIGUITY: f64 = 0.80;
pub const WEIGHT_CONFIDENCE_BASE: f64 = 0.35;
pub const WEIGHT_CONFIDENCE_SCALE: f64 = 0.55;
pub const WEIGHT_BLAST_RADIUS_BASE: f64 = 0.30;
pub const WEIGHT_BLAST_RADIUS_SCALE: f64 = 0.45;
pub const WEIGHT_SENSITIVE_FILES: f64 = 0.85;
pub const WEIGHT_PRE_COMMIT: f64 = 0.65;
pub const WEIGHT_FAILING_CHECKS: f64 = 0.90;

/// Score at or above which a decision is critical regardless of gates.
const CRITICAL_SCORE: f64 = 0.90;
/// Fraction of the pause threshold at which a continue decision is medium severity.
const MEDIUM_FRACTION: f64 = 0.60;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("{field} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { field: &'static str, value: f64 },
    #[error("unknown policy style: {0}")]
    UnknownStyle(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Preset posture of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStyle {
    Strict,
    #[default]
    Balanced,
    Autonomous,
}

impl CheckpointStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Balanced => "balanced",
            Self::Autonomous => "autonomous",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "strict" => Ok(Self::Strict),
            "balanced" => Ok(Self::Balanced),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(PolicyError::UnknownStyle(other.to_string())),
        }
    }
}

/// Identifies one of the six policy conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    AmbiguityBlocker,
    ConfidenceBelowThreshold,
    HighBlastRadius,
    SensitiveFiles,
    PreCommitApproval,
    FailingChecks,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmbiguityBlocker => "ambiguity_blocker",
            Self::ConfidenceBelowThreshold => "confidence_below_threshold",
            Self::HighBlastRadius => "high_blast_radius",
            Self::SensitiveFiles => "sensitive_files",
            Self::PreCommitApproval => "pre_commit_approval",
            Self::FailingChecks => "failing_checks",
        }
    }
}

/// One flag per condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyGates {
    pub ambiguity_blocker: bool,
    pub confidence_below_threshold: bool,
    pub high_blast_radius: bool,
    pub sensitive_files: bool,
    pub pre_commit_approval: bool,
    pub failing_checks: bool,
}

impl PolicyGates {
    pub fn all() -> Self {
        Self {
            ambiguity_blocker: true,
            confidence_below_threshold: true,
            high_blast_radius: true,
            sensitive_files: true,
            pre_commit_approval: true,
            failing_checks: true,
        }
    }

    pub fn get(&self, code: ReasonCode) -> bool {
        match code {
            ReasonCode::AmbiguityBlocker => self.ambiguity_blocker,
            ReasonCode::ConfidenceBelowThreshold => self.confidence_below_threshold,
            ReasonCode::HighBlastRadius => self.high_blast_radius,
            ReasonCode::SensitiveFiles => self.sensitive_files,
            ReasonCode::PreCommitApproval => self.pre_commit_approval,
            ReasonCode::FailingChecks => self.failing_checks,
        }
    }

    fn apply(&mut self, overrides: &PolicyGatesOverride) {
        let pairs = [
            (&mut self.ambiguity_blocker, overrides.ambiguity_blocker),
            (
                &mut self.confidence_below_threshold,
                overrides.confidence_below_threshold,
            ),
            (&mut self.high_blast_radius, overrides.high_blast_radius),
            (&mut self.sensitive_files, overrides.sensitive_files),
            (&mut self.pre_commit_approval, overrides.pre_commit_approval),
            (&mut self.failing_checks, overrides.failing_checks),
        ];
        for (slot, value) in pairs {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// Per-run partial override of a gate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyGatesOverride {
    pub ambiguity_blocker: Option<bool>,
    pub confidence_below_threshold: Option<bool>,
    pub high_blast_radius: Option<bool>,
    pub sensitive_files: Option<bool>,
    pub pre_commit_approval: Option<bool>,
    pub failing_checks: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub style: CheckpointStyle,
    pub confidence_threshold: f64,
    pub pause_threshold: f64,
    /// File count at or above which a change counts as high blast radius.
    pub high_blast_radius_file_count: u32,
    pub hard_gates: PolicyGates,
    pub conditional_gates: PolicyGates,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::for_style(CheckpointStyle::Balanced)
    }
}

impl CheckpointPolicy {
    /// Preset policy for a style.
    pub fn for_style(style: CheckpointStyle) -> Self {
        match style {
            CheckpointStyle::Strict => Self {
                style,
                confidence_threshold: 0.80,
                pause_threshold: 0.50,
                high_blast_radius_file_count: 10,
                hard_gates: PolicyGates {
                    ambiguity_blocker: true,
                    sensitive_files: true,
                    pre_commit_approval: true,
                    failing_checks: true,
                    ..PolicyGates::default()
                },
                conditional_gates: PolicyGates::all(),
            },
            CheckpointStyle::Balanced => Self {
                style,
                confidence_threshold: 0.70,
                pause_threshold: 0.70,
                high_blast_radius_file_count: 20,
                hard_gates: PolicyGates {
                    ambiguity_blocker: true,
                    ..PolicyGates::default()
                },
                conditional_gates: PolicyGates::all(),
            },
            CheckpointStyle::Autonomous => Self {
                style,
                confidence_threshold: 0.50,
                pause_threshold: 0.90,
                high_blast_radius_file_count: 50,
                hard_gates: PolicyGates::default(),
                conditional_gates: PolicyGates::all(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("confidence_threshold", self.confidence_threshold)?;
        check_unit("pause_threshold", self.pause_threshold)?;
        Ok(())
    }

    /// Effective policy after applying per-run overrides.
    pub fn merged(&self, overrides: &CheckpointPolicyOverrides) -> Result<Self> {
        let mut policy = match overrides.style {
            Some(style) if style != self.style => Self::for_style(style),
            _ => self.clone(),
        };
        if let Some(value) = overrides.confidence_threshold {
            policy.confidence_threshold = value;
        }
        if let Some(value) = overrides.pause_threshold {
            policy.pause_threshold = value;
        }
        if let Some(value) = overrides.high_blast_radius_file_count {
            policy.high_blast_radius_file_count = value;
        }
        policy.hard_gates.apply(&overrides.hard_gates);
        policy.conditional_gates.apply(&overrides.conditional_gates);
        policy.validate()?;
        Ok(policy)
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::ThresholdOutOfRange { field, value })
    }
}

/// Per-run policy overrides supplied at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicyOverrides {
    pub style: Option<CheckpointStyle>,
    pub confidence_threshold: Option<f64>,
    pub pause_threshold: Option<f64>,
    pub high_blast_radius_file_count: Option<u32>,
    pub hard_gates: PolicyGatesOverride,
    pub conditional_gates: PolicyGatesOverride,
}

/// Signals a checkpoint is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationInput {
    /// Agent confidence in `[0, 1]`; absent means fully confident.
    pub confidence: Option<f64>,
    pub ambiguity_or_blocker: bool,
    pub blast_radius_file_count: u32,
    pub sensitive_files: Vec<String>,
    pub pre_commit_approval_required: bool,
    pub failing_checks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAction {
    Continue,
    Pause,
}

impl CheckpointAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Self::Low => Tier::Tier0,
            Self::Medium => Tier::Tier1,
            Self::High => Tier::Tier2,
            Self::Critical => Tier::Tier3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier0,
    Tier1,
    Tier2,
    Tier3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointReason {
    pub code: ReasonCode,
    pub message: String,
    pub hard_gate: bool,
}

/// Immutable result of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDecisionMetadata {
    pub action: CheckpointAction,
    pub reasons: Vec<CheckpointReason>,
    pub severity: Severity,
    pub tier: Tier,
    pub style: CheckpointStyle,
    pub confidence: f64,
    pub confidence_threshold: f64,
    pub score: f64,
    pub pause_threshold: f64,
    pub hard_gate_triggered: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl CheckpointDecisionMetadata {
    /// Human-readable one-line summary of the triggered reasons.
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            return format!("no checkpoint reasons (score {:.2})", self.score);
        }
        self.reasons
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

struct Tally<'a> {
    policy: &'a CheckpointPolicy,
    reasons: Vec<CheckpointReason>,
    score: f64,
    hard_gate_triggered: bool,
}

impl Tally<'_> {
    fn consider(&mut self, code: ReasonCode, triggered: bool, weight: f64, message: String) {
        if !triggered {
            return;
        }
        let hard = self.policy.hard_gates.get(code);
        let conditional = self.policy.conditional_gates.get(code);
        if !hard && !conditional {
            return;
        }
        self.hard_gate_triggered |= hard;
        self.score = clamp_unit(self.score + weight);
        self.reasons.push(CheckpointReason {
            code,
            message,
            hard_gate: hard,
        });
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Evaluate `input` against `policy`.
pub fn evaluate(
    policy: &CheckpointPolicy,
    input: &EvaluationInput,
    now: DateTime<Utc>,
) -> CheckpointDecisionMetadata {
    let confidence = input.confidence.map_or(1.0, clamp_unit);
    let mut tally = Tally {
        policy,
        reasons: Vec::new(),
        score: 0.0,
        hard_gate_triggered: false,
    };

    tally.consider(
        ReasonCode::AmbiguityBlocker,
        input.ambiguity_or_blocker,
        WEIGHT_AMBIGUITY,
        "agent reported ambiguity or a blocker".to_string(),
    );

    let threshold = policy.confidence_threshold;
    let below = confidence < threshold;
    let gap = if below && threshold > 0.0 {
        clamp_unit((threshold - confidence) / threshold)
    } else {
        0.0
    };
    tally.consider(
        ReasonCode::ConfidenceBelowThreshold,
        below,
        WEIGHT_CONFIDENCE_BASE + WEIGHT_CONFIDENCE_SCALE * gap,
        format!("confidence {confidence:.2} is below threshold {threshold:.2}"),
    );

    let limit = policy.high_blast_radius_file_count;
    let files = input.blast_radius_file_count;
    let wide = limit > 0 && files >= limit;
    let ratio = if wide {
        clamp_unit(f64::from(files - limit) / f64::from(limit))
    } else {
        0.0
    };
    tally.consider(
        ReasonCode::HighBlastRadius,
        wide,
        WEIGHT_BLAST_RADIUS_BASE + WEIGHT_BLAST_RADIUS_SCALE * ratio,
        format!("change touches {files} files (threshold {limit})"),
    );

    tally.consider(
        ReasonCode::SensitiveFiles,
        !input.sensitive_files.is_empty(),
        WEIGHT_SENSITIVE_FILES,
        format!("sensitive files touched: {}", input.sensitive_files.join(", ")),
    );

    tally.consider(
        ReasonCode::PreCommitApproval,
        input.pre_commit_approval_required,
        WEIGHT_PRE_COMMIT,
        "commit requires approval".to_string(),
    );

    tally.consider(
        ReasonCode::FailingChecks,
        !input.failing_checks.is_empty(),
        WEIGHT_FAILING_CHECKS,
        format!("failing checks: {}", input.failing_checks.join(", ")),
    );

    let Tally {
        reasons,
        score,
        hard_gate_triggered,
        ..
    } = tally;

    let action = if hard_gate_triggered || score >= policy.pause_threshold {
        CheckpointAction::Pause
    } else {
        CheckpointAction::Continue
    };

    let severity = if hard_gate_triggered || score >= CRITICAL_SCORE {
        Severity::Critical
    } else if action == CheckpointAction::Pause {
        Severity::High
    } else if score >= MEDIUM_FRACTION * policy.pause_threshold {
        Severity::Medium
    } else {
        Severity::Low
    };

    CheckpointDecisionMetadata {
        action,
        reasons,
        severity,
        tier: severity.tier(),
        style: policy.style,
        confidence,
        confidence_threshold: threshold,
        score,
        pause_threshold: policy.pause_threshold,
        hard_gate_triggered,
        evaluated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CheckpointPolicy {
        CheckpointPolicy::default()
    }

    fn codes(meta: &CheckpointDecisionMetadata) -> Vec<ReasonCode> {
        meta.reasons.iter().map(|r| r.code).collect()
    }

    #[test]
    fn empty_input_continues_with_low_severity() {
        let meta = evaluate(&policy(), &EvaluationInput::default(), Utc::now());
        assert_eq!(meta.action, CheckpointAction::Continue);
        assert_eq!(meta.severity, Severity::Low);
        assert_eq!(meta.tier, Tier::Tier0);
        assert!((meta.confidence - 1.0).abs() < f64::EPSILON);
        assert!(meta.reasons.is_empty());
    }

    #[test]
    fn confidence_at_threshold_does_not_trigger() {
        let input = EvaluationInput {
            confidence: Some(0.70),
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert!(!codes(&meta).contains(&ReasonCode::ConfidenceBelowThreshold));
    }

    #[test]
    fn confidence_one_unit_below_threshold_triggers() {
        let input = EvaluationInput {
            confidence: Some(0.69),
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert_eq!(codes(&meta), vec![ReasonCode::ConfidenceBelowThreshold]);
        // Small gap stays close to the base weight.
        assert!(meta.score > WEIGHT_CONFIDENCE_BASE);
        assert!(meta.score < WEIGHT_CONFIDENCE_BASE + 0.02);
    }

    #[test]
    fn confidence_is_clamped() {
        let input = EvaluationInput {
            confidence: Some(1.7),
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert!((meta.confidence - 1.0).abs() < f64::EPSILON);

        let input = EvaluationInput {
            confidence: Some(-0.5),
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert!(meta.confidence.abs() < f64::EPSILON);
        // Full gap: 0.35 + 0.55 = 0.90 → critical by score.
        assert!((meta.score - 0.90).abs() < 1e-9);
        assert_eq!(meta.severity, Severity::Critical);
    }

    #[test]
    fn hard_gate_forces_pause_and_critical() {
        let input = EvaluationInput {
            ambiguity_or_blocker: true,
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert_eq!(meta.action, CheckpointAction::Pause);
        assert!(meta.hard_gate_triggered);
        assert_eq!(meta.severity, Severity::Critical);
        assert_eq!(meta.tier, Tier::Tier3);
        assert!(meta.reasons[0].hard_gate);
    }

    #[test]
    fn pre_commit_alone_is_medium_continue() {
        let input = EvaluationInput {
            pre_commit_approval_required: true,
            ..Default::default()
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert_eq!(meta.action, CheckpointAction::Continue);
        assert_eq!(meta.severity, Severity::Medium);
        assert!((meta.score - WEIGHT_PRE_COMMIT).abs() < 1e-9);
    }

    #[test]
    fn ungated_condition_is_ignored() {
        let mut policy = policy();
        policy.conditional_gates.sensitive_files = false;
        let input = EvaluationInput {
            sensitive_files: vec![".env".to_string()],
            ..Default::default()
        };
        let meta = evaluate(&policy, &input, Utc::now());
        assert!(meta.reasons.is_empty());
        assert!(meta.score.abs() < f64::EPSILON);
    }

    #[test]
    fn score_pause_is_high_severity() {
        let input = EvaluationInput {
            blast_radius_file_count: 30,
            pre_commit_approval_required: true,
            ..Default::default()
        };
        // 0.30 + 0.45 * 0.5 = 0.525, plus 0.65 → clamped to 1.0.
        let meta = evaluate(&policy(), &input, Utc::now());
        assert_eq!(meta.action, CheckpointAction::Pause);
        assert!((meta.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(meta.severity, Severity::Critical);

        let mut policy = policy();
        policy.pause_threshold = 0.5;
        let input = EvaluationInput {
            blast_radius_file_count: 20,
            confidence: Some(0.69),
            ..Default::default()
        };
        let meta = evaluate(&policy, &input, Utc::now());
        // 0.30 + ~0.358 = ~0.658 → pause, below critical.
        assert_eq!(meta.action, CheckpointAction::Pause);
        assert_eq!(meta.severity, Severity::High);
        assert_eq!(meta.tier, Tier::Tier2);
    }

    #[test]
    fn reasons_follow_fixed_order() {
        let input = EvaluationInput {
            confidence: Some(0.1),
            ambiguity_or_blocker: true,
            blast_radius_file_count: 100,
            sensitive_files: vec!["secrets.toml".to_string()],
            pre_commit_approval_required: true,
            failing_checks: vec!["tests".to_string()],
        };
        let meta = evaluate(&policy(), &input, Utc::now());
        assert_eq!(
            codes(&meta),
            vec![
                ReasonCode::AmbiguityBlocker,
                ReasonCode::ConfidenceBelowThreshold,
                ReasonCode::HighBlastRadius,
                ReasonCode::SensitiveFiles,
                ReasonCode::PreCommitApproval,
                ReasonCode::FailingChecks,
            ]
        );
        assert!(meta.score <= 1.0);
    }

    #[test]
    fn overrides_merge_onto_base() {
        let overrides = CheckpointPolicyOverrides {
            pause_threshold: Some(0.4),
            hard_gates: PolicyGatesOverride {
                pre_commit_approval: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = policy().merged(&overrides).unwrap();
        assert!((merged.pause_threshold - 0.4).abs() < f64::EPSILON);
        assert!(merged.hard_gates.pre_commit_approval);
        assert!(merged.hard_gates.ambiguity_blocker);
        assert!((merged.confidence_threshold - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_reject_out_of_range_threshold() {
        let overrides = CheckpointPolicyOverrides {
            confidence_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            policy().merged(&overrides),
            Err(PolicyError::ThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn style_parse_round_trips() {
        for style in [
            CheckpointStyle::Strict,
            CheckpointStyle::Balanced,
            CheckpointStyle::Autonomous,
        ] {
            assert_eq!(CheckpointStyle::parse(style.as_str()).unwrap(), style);
        }
        assert!(CheckpointStyle::parse("yolo").is_err());
    }
}
