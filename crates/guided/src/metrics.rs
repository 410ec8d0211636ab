//! Aggregate run metrics.

use std::collections::BTreeMap;

use guide_core::RunStatus;
use serde::{Deserialize, Serialize};

/// Counters persisted as a single snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetrics {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_paused: u64,
    pub approvals: u64,
    pub approval_latency_avg_ms: f64,
    pub approval_latency_max_ms: u64,
    /// Why runs needed a human: policy reason codes, manual pauses, failures.
    pub intervention_causes: BTreeMap<String, u64>,
}

impl RunMetrics {
    /// Count a run status change.
    pub fn observe_transition(&mut self, from: RunStatus, to: RunStatus) {
        if from == to {
            return;
        }
        match to {
            RunStatus::Running if from == RunStatus::Created => self.runs_started += 1,
            RunStatus::Paused => self.runs_paused += 1,
            RunStatus::Completed => self.runs_completed += 1,
            RunStatus::Failed => self.runs_failed += 1,
            _ => {}
        }
    }

    pub fn record_approval(&mut self, latency_ms: u64) {
        self.approvals += 1;
        let n = self.approvals as f64;
        self.approval_latency_avg_ms += (latency_ms as f64 - self.approval_latency_avg_ms) / n;
        self.approval_latency_max_ms = self.approval_latency_max_ms.max(latency_ms);
    }

    pub fn record_intervention(&mut self, cause: &str) {
        *self
            .intervention_causes
            .entry(cause.to_string())
            .or_insert(0) += 1;
    }
}
