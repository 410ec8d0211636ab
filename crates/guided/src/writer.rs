//! Background snapshot writer.
//!
//! All persistence from the run service goes through one task so writes are
//! applied in the order they were issued and are never tied to the lifetime of
//! the request that caused them. `flush` waits for everything queued so far.

use std::sync::Arc;

use guide_core::{DismissedRunRecord, RunSnapshot};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::metrics::RunMetrics;
use crate::storage::{RunMetricsStore, RunSnapshotStore};

enum WriteOp {
    Run(Box<RunSnapshot>),
    Dismissed(DismissedRunRecord),
    Metrics(RunMetrics),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl SnapshotWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(
        snapshots: Option<Arc<dyn RunSnapshotStore>>,
        metrics: Option<Arc<dyn RunMetricsStore>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Run(snapshot) => {
                        if let Some(store) = &snapshots {
                            if let Err(e) = store.upsert_workflow_run(&snapshot).await {
                                error!(run_id = %snapshot.run.id, error = %e, "failed to persist run snapshot");
                            }
                        }
                    }
                    WriteOp::Dismissed(record) => {
                        if let Some(store) = &snapshots {
                            if let Err(e) = store.upsert_dismissed_run(&record).await {
                                error!(run_id = %record.run_id, error = %e, "failed to persist dismissal");
                            }
                        }
                    }
                    WriteOp::Metrics(snapshot) => {
                        if let Some(store) = &metrics {
                            if let Err(e) = store.save_metrics(&snapshot).await {
                                error!(error = %e, "failed to persist metrics");
                            }
                        }
                    }
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("snapshot writer stopped");
        });
        Self { tx }
    }

    pub fn upsert_run(&self, snapshot: RunSnapshot) {
        self.send(WriteOp::Run(Box::new(snapshot)));
    }

    pub fn upsert_dismissed(&self, record: DismissedRunRecord) {
        self.send(WriteOp::Dismissed(record));
    }

    pub fn save_metrics(&self, metrics: RunMetrics) {
        self.send(WriteOp::Metrics(metrics));
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(WriteOp::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            error!("snapshot writer is gone, dropping write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use guide_core::policy::CheckpointPolicy;
    use guide_core::templates::builtin_templates;
    use guide_core::{Id, RunContext, RunStatus, WorkflowRun};

    #[tokio::test]
    async fn flush_waits_for_queued_writes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::spawn(
            Some(Arc::clone(&store) as Arc<dyn RunSnapshotStore>),
            Some(Arc::clone(&store) as Arc<dyn RunMetricsStore>),
        );

        let run = WorkflowRun::instantiate(
            Id::new(),
            &builtin_templates().remove(0),
            RunContext::default(),
            CheckpointPolicy::default(),
            Utc::now(),
        );
        let mut snapshot = RunSnapshot::new(run);
        writer.upsert_run(snapshot.clone());
        snapshot.run.status = RunStatus::Running;
        writer.upsert_run(snapshot.clone());
        writer.save_metrics(RunMetrics {
            runs_started: 1,
            ..Default::default()
        });
        writer.flush().await;

        let runs = store.list_workflow_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run.status, RunStatus::Running);
        assert_eq!(store.load_metrics().await.unwrap().unwrap().runs_started, 1);
    }

    #[tokio::test]
    async fn writes_without_store_are_dropped_quietly() {
        let writer = SnapshotWriter::spawn(None, None);
        writer.save_metrics(RunMetrics::default());
        writer.flush().await;
    }
}
