//! Periodic reconciliation of failed cleanups.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use runlane_types::{FailedCleanupRecord, FailedCleanupStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{action::CleanupActionRegistry, error::StoreError, store::FailedCleanupStore};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Outcome of one sweep over the pending records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub store_errors: usize,
}

/// Totals across every sweep of a [`Reconciler::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub sweeps: u32,
    pub resolved: usize,
    pub abandoned: usize,
    pub store_errors: usize,
}

pub struct Reconciler {
    store: Arc<dyn FailedCleanupStore>,
    actions: Arc<CleanupActionRegistry>,
    interval: Duration,
    retry_ceiling: u32,
    iterations: Option<u32>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn FailedCleanupStore>, actions: Arc<CleanupActionRegistry>) -> Self {
        Self {
            store,
            actions,
            interval: DEFAULT_RECONCILE_INTERVAL,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            iterations: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Records are abandoned once their retry count reaches `ceiling`.
    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling.max(1);
        self
    }

    /// Stop after `iterations` sweeps instead of running until canceled.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Sweep, then wait for the interval, until canceled or out of iterations.
    pub async fn run(&self, cancel: CancellationToken) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.sweep().await {
                Ok(report) => {
                    summary.resolved += report.resolved;
                    summary.abandoned += report.abandoned;
                    summary.store_errors += report.store_errors;
                }
                Err(store_error) => {
                    warn!(error = %store_error, "reconciliation sweep failed");
                    summary.store_errors += 1;
                }
            }
            summary.sweeps += 1;

            if self.iterations.is_some_and(|limit| summary.sweeps >= limit) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(sweeps = summary.sweeps, resolved = summary.resolved, abandoned = summary.abandoned, "reconciliation stopped");
        summary
    }

    /// Re-execute every open record below the retry ceiling once.
    ///
    /// Only listing the records fails the sweep. A store error on a single
    /// record is logged and counted, and the sweep moves on.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let pending = self.store.list_pending(self.retry_ceiling).await?;
        let mut report = SweepReport {
            examined: pending.len(),
            ..SweepReport::default()
        };
        debug!(pending = pending.len(), "reconciliation sweep");

        for record in pending {
            if let Err(store_error) = self.reconcile_record(record, &mut report).await {
                warn!(error = %store_error, "could not update failed cleanup; continuing sweep");
                report.store_errors += 1;
            }
        }
        Ok(report)
    }

    async fn reconcile_record(&self, mut record: FailedCleanupRecord, report: &mut SweepReport) -> Result<(), StoreError> {
        if !record.idempotent {
            warn!(
                record_id = %record.id,
                workflow_id = %record.workflow_id,
                step = %record.step_name,
                "abandoning non-idempotent failed cleanup without re-running it"
            );
            record.status = FailedCleanupStatus::Abandoned;
            self.store.update(&record).await?;
            report.abandoned += 1;
            return Ok(());
        }

        record.status = FailedCleanupStatus::Retrying;
        record.last_attempt = Some(Utc::now());
        self.store.update(&record).await?;

        let step = record.to_step_spec();
        match self.actions.execute(&step).await {
            Ok(()) => {
                info!(record_id = %record.id, workflow_id = %record.workflow_id, step = %record.step_name, "failed cleanup resolved");
                self.store.delete(&record.id).await?;
                report.resolved += 1;
            }
            Err(cause) => {
                record.retry_count += 1;
                record.error = cause.to_string();
                record.last_attempt = Some(Utc::now());
                if record.retry_count >= self.retry_ceiling {
                    record.status = FailedCleanupStatus::Abandoned;
                    warn!(
                        record_id = %record.id,
                        workflow_id = %record.workflow_id,
                        step = %record.step_name,
                        retry_count = record.retry_count,
                        "abandoning failed cleanup"
                    );
                    report.abandoned += 1;
                } else {
                    record.status = FailedCleanupStatus::Pending;
                    report.retried += 1;
                }
                self.store.update(&record).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use runlane_types::CleanupStepSpec;
    use serde_json::json;

    use super::*;
    use crate::{
        action::{CleanupAction, STOP_EMULATOR, scripted::ScriptedAction},
        error::CleanupError,
        store::MemoryFailedCleanupStore,
    };

    async fn seeded_store(step_name: &str) -> Arc<MemoryFailedCleanupStore> {
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let step = CleanupStepSpec::new(step_name, STOP_EMULATOR, json!({"emulator_id": "e1"}));
        store
            .record_failure(FailedCleanupRecord::pending("wf-1", &step, "boom", Utc::now()))
            .await
            .expect("seed");
        store
    }

    #[tokio::test]
    async fn success_deletes_record() {
        let store = seeded_store("stop e1").await;
        let actions = CleanupActionRegistry::new().register(STOP_EMULATOR, Arc::new(ScriptedAction::default()));
        let reconciler = Reconciler::new(store.clone(), Arc::new(actions));

        let report = reconciler.sweep().await.expect("sweep");
        assert_eq!(report.resolved, 1);
        assert!(store.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_is_abandoned_at_ceiling() {
        let store = seeded_store("stop e1").await;
        let actions = CleanupActionRegistry::new().register(STOP_EMULATOR, Arc::new(ScriptedAction::failing("stop e1", u32::MAX)));
        let reconciler = Reconciler::new(store.clone(), Arc::new(actions))
            .with_retry_ceiling(3)
            .with_interval(Duration::from_secs(60))
            .with_iterations(5);

        reconciler.sweep().await.expect("first");
        reconciler.sweep().await.expect("second");
        let record = &store.records()[0];
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.status, FailedCleanupStatus::Pending);

        let summary = reconciler.run(CancellationToken::new()).await;
        assert_eq!(summary.sweeps, 5);
        assert_eq!(summary.abandoned, 1);
        let record = &store.records()[0];
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.status, FailedCleanupStatus::Abandoned);
    }

    /// Memory store whose next delete fails.
    #[derive(Default)]
    struct FlakyDeletes {
        inner: MemoryFailedCleanupStore,
        fail_next_delete: AtomicBool,
    }

    #[async_trait]
    impl FailedCleanupStore for FlakyDeletes {
        async fn record_failure(&self, record: FailedCleanupRecord) -> Result<String, StoreError> {
            self.inner.record_failure(record).await
        }

        async fn list_pending(&self, retry_ceiling: u32) -> Result<Vec<FailedCleanupRecord>, StoreError> {
            self.inner.list_pending(retry_ceiling).await
        }

        async fn resolve(&self, workflow_id: &str, step_name: &str) -> Result<usize, StoreError> {
            self.inner.resolve(workflow_id, step_name).await
        }

        async fn update(&self, record: &FailedCleanupRecord) -> Result<(), StoreError> {
            self.inner.update(record).await
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            if self.fail_next_delete.swap(false, Ordering::SeqCst) {
                return Err(StoreError::backend("record store unavailable"));
            }
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn store_error_on_one_record_does_not_stop_the_sweep() {
        let store = Arc::new(FlakyDeletes {
            fail_next_delete: AtomicBool::new(true),
            ..FlakyDeletes::default()
        });
        for name in ["stop e1", "stop e2"] {
            let step = CleanupStepSpec::new(name, STOP_EMULATOR, json!({}));
            store
                .record_failure(FailedCleanupRecord::pending("wf-1", &step, "boom", Utc::now()))
                .await
                .expect("seed");
        }
        let actions = CleanupActionRegistry::new().register(STOP_EMULATOR, Arc::new(ScriptedAction::default()));
        let reconciler = Reconciler::new(store.clone(), Arc::new(actions));

        let report = reconciler.sweep().await.expect("sweep");
        assert_eq!(report.examined, 2);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.store_errors, 1);

        // The record left RETRYING by the failed delete is picked up again.
        let left = store.inner.records();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].step_name, "stop e1");
        assert_eq!(left[0].status, FailedCleanupStatus::Retrying);

        let report = reconciler.sweep().await.expect("second sweep");
        assert_eq!(report.resolved, 1);
        assert!(store.inner.records().is_empty());
    }

    struct Stuck;

    #[async_trait]
    impl CleanupAction for Stuck {
        async fn execute(&self, _: &CleanupStepSpec) -> Result<(), CleanupError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_with_stored_timeout() {
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let step = CleanupStepSpec::new("stop e1", STOP_EMULATOR, json!({})).with_timeout(Duration::from_millis(10));
        store
            .record_failure(FailedCleanupRecord::pending("wf-1", &step, "boom", Utc::now()))
            .await
            .expect("seed");
        let actions = CleanupActionRegistry::new().register(STOP_EMULATOR, Arc::new(Stuck));
        let reconciler = Reconciler::new(store.clone(), Arc::new(actions));

        let report = reconciler.sweep().await.expect("sweep");
        assert_eq!(report.retried, 1);
        let record = &store.records()[0];
        assert_eq!(record.status, FailedCleanupStatus::Pending);
        assert!(record.error.contains("timed out"), "{}", record.error);
    }

    #[tokio::test]
    async fn non_idempotent_record_is_abandoned_without_running() {
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let step = CleanupStepSpec::new("upload rec", STOP_EMULATOR, json!({})).non_idempotent();
        store
            .record_failure(FailedCleanupRecord::pending("wf-1", &step, "boom", Utc::now()))
            .await
            .expect("seed");
        let action = Arc::new(ScriptedAction::default());
        let actions = CleanupActionRegistry::new().register(STOP_EMULATOR, action.clone());
        let reconciler = Reconciler::new(store.clone(), Arc::new(actions));

        let report = reconciler.sweep().await.expect("sweep");
        assert_eq!(report.abandoned, 1);
        assert!(action.calls().is_empty());
        assert_eq!(store.records()[0].status, FailedCleanupStatus::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let reconciler = Reconciler::new(store, Arc::new(CleanupActionRegistry::new()));
        let cancel = CancellationToken::new();

        let child = cancel.clone();
        let handle = tokio::spawn(async move { reconciler.run(child).await });
        tokio::time::sleep(Duration::from_secs(12 * 60)).await;
        cancel.cancel();

        let summary = handle.await.expect("join");
        assert_eq!(summary.sweeps, 3);
    }
}
