//! Step prompt dispatch and deferred-dispatch retries.
//!
//! A dispatcher hands a step's prompt to the external execution agent. When a
//! dispatch fails with a transient error the run id is queued on the
//! `DispatchRetryScheduler`, which keeps at most one retry task per run and
//! stops every task as soon as it is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use guide_core::{Id, StepRuntimeOptions};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Everything the execution agent needs to run one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDispatchRequest {
    pub run_id: Id,
    pub template_id: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub session_id: Option<String>,
    pub phase_id: String,
    pub step_id: String,
    pub prompt: String,
    pub runtime_options: Option<StepRuntimeOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepDispatchResult {
    pub dispatched: bool,
    pub session_id: Option<String>,
    pub turn_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Dispatch failure reported by a dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
    /// Dispatcher's hint that a later attempt may succeed.
    pub transient: bool,
}

impl DispatchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorClass {
    /// Unclassified.
    None,
    Deferred,
    Fatal,
}

impl DispatchErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deferred => "deferred",
            Self::Fatal => "fatal",
        }
    }
}

/// Sends step prompts to the external execution agent.
#[async_trait]
pub trait StepPromptDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        request: &StepDispatchRequest,
    ) -> std::result::Result<StepDispatchResult, DispatchError>;
}

/// Decides whether a dispatch error is retried later or fails the run.
pub trait DispatchErrorClassifier: Send + Sync {
    fn classify(&self, error: &DispatchError) -> DispatchErrorClass;
}

/// Uses the dispatcher's transient hint; everything else is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransientHintClassifier;

impl DispatchErrorClassifier for TransientHintClassifier {
    fn classify(&self, error: &DispatchError) -> DispatchErrorClass {
        if error.transient {
            DispatchErrorClass::Deferred
        } else {
            DispatchErrorClass::Fatal
        }
    }
}

/// Backoff schedule for deferred dispatches.
pub trait DispatchRetryPolicy: Send + Sync {
    /// Delay before retry `attempt` (1-based), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Doubling delay starting at `initial`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedExponentialDispatchRetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Give up after this many attempts; `None` retries until closed.
    pub max_attempts: Option<u32>,
}

impl Default for BoundedExponentialDispatchRetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(4))
    }
}

impl BoundedExponentialDispatchRetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_attempts: None,
        }
    }
}

impl DispatchRetryPolicy for BoundedExponentialDispatchRetryPolicy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Re-drives a run whose dispatch was deferred.
#[async_trait]
pub trait DispatchRetryAttempt: Send + Sync {
    /// Returns `true` when the run needs no further retries.
    async fn attempt(&self, run_id: &Id, attempt: u32) -> bool;
}

/// Where a run's retry task is. An enqueue that arrives while an attempt is
/// running re-arms the task, since that attempt may already have decided it
/// was done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Attempting,
    Rearmed,
}

/// One self-terminating retry task per run id.
pub struct DispatchRetryScheduler {
    policy: Arc<dyn DispatchRetryPolicy>,
    callback: Arc<dyn DispatchRetryAttempt>,
    inflight: Arc<Mutex<HashMap<Id, Slot>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for DispatchRetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRetryScheduler")
            .field("inflight", &self.inflight_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl DispatchRetryScheduler {
    pub fn new(
        policy: Arc<dyn DispatchRetryPolicy>,
        callback: Arc<dyn DispatchRetryAttempt>,
    ) -> Self {
        Self {
            policy,
            callback,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start a retry task for `run_id` unless one is already running.
    /// Returns whether a task was started.
    pub fn enqueue(&self, run_id: &Id) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = inflight.get_mut(run_id) {
                if *slot == Slot::Attempting {
                    *slot = Slot::Rearmed;
                }
                debug!(run_id = %run_id, slot = ?slot, "dispatch retry already scheduled");
                return false;
            }
            inflight.insert(run_id.clone(), Slot::Waiting);
        }

        let run_id = run_id.clone();
        let policy = Arc::clone(&self.policy);
        let callback = Arc::clone(&self.callback);
        let inflight = Arc::clone(&self.inflight);
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let set_slot = |slot: Slot| {
                inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(run_id.clone(), slot);
            };
            let mut attempt = 1u32;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(delay) = policy.next_delay(attempt) else {
                    info!(run_id = %run_id, attempt, "dispatch retries exhausted");
                    break;
                };

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                // Closing wins even if the timer fired first.
                if cancel.is_cancelled() {
                    break;
                }

                debug!(run_id = %run_id, attempt, delay_ms = delay.as_millis() as u64, "retrying deferred dispatch");
                set_slot(Slot::Attempting);
                let done = callback.attempt(&run_id, attempt).await;
                if !done {
                    set_slot(Slot::Waiting);
                    attempt = attempt.saturating_add(1);
                    continue;
                }

                let mut inflight = inflight.lock().unwrap_or_else(PoisonError::into_inner);
                if inflight.get(&run_id) == Some(&Slot::Rearmed) {
                    debug!(run_id = %run_id, "dispatch retry re-armed during attempt");
                    inflight.insert(run_id.clone(), Slot::Waiting);
                    attempt = 1;
                    continue;
                }
                inflight.remove(&run_id);
                return;
            }
            inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&run_id);
        });
        true
    }

    pub fn is_scheduled(&self, run_id: &Id) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop all tasks and wait for them to exit. Safe to call more than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
