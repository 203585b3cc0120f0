//! Delayed one-shot verification of a run's cleanup.
//!
//! Re-runs the idempotent steps of a finished run shortly after it ended so a
//! failed teardown is caught before the next reconciliation sweep. A step that
//! succeeds on this pass clears its failed-cleanup record.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    action::CleanupActionRegistry,
    saga::{CleanupSaga, FailureRecorder, SagaReport},
};

pub const DEFAULT_VERIFICATION_DELAY: Duration = Duration::from_secs(60);

/// Wait `delay`, then run the idempotent steps of `saga` again. Returns `None`
/// when canceled first.
pub async fn verify_cleanup(
    delay: Duration,
    saga: &CleanupSaga,
    actions: &CleanupActionRegistry,
    on_failure: Option<&FailureRecorder>,
    cancel: &CancellationToken,
) -> Option<SagaReport> {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("cleanup verification canceled");
            return None;
        }
        _ = tokio::time::sleep(delay) => {}
    }
    let recorder = on_failure.cloned().map(FailureRecorder::resolving_on_success);
    let report = saga.idempotent_only().run(actions, recorder.as_ref()).await;
    info!(
        workflow_id = on_failure.map(FailureRecorder::workflow_id).unwrap_or_default(),
        attempted = report.attempted,
        failed = report.errors.len(),
        "cleanup verification finished"
    );
    Some(report)
}

/// Spawn [`verify_cleanup`] on a detached task.
pub fn schedule_verification(
    delay: Duration,
    saga: CleanupSaga,
    actions: Arc<CleanupActionRegistry>,
    on_failure: Option<FailureRecorder>,
    cancel: CancellationToken,
) -> JoinHandle<Option<SagaReport>> {
    tokio::spawn(async move { verify_cleanup(delay, &saga, &actions, on_failure.as_ref(), &cancel).await })
}
