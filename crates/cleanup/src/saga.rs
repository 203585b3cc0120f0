//! The compensating cleanup saga.
//!
//! Steps are appended as a run acquires resources and executed in reverse
//! order, one at a time. A failing step is retried with exponential backoff
//! and, once it gives up, reported and optionally persisted for
//! reconciliation. The saga always moves on to the next step.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use runlane_types::{CleanupStepSpec, FailedCleanupRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{action::CleanupActionRegistry, error::CleanupError, store::FailedCleanupStore};

/// Base delay between attempts; attempt `n` waits `2^(n-1)` units.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Persists steps that exhausted their retries for one workflow.
#[derive(Clone)]
pub struct FailureRecorder {
    workflow_id: String,
    store: Arc<dyn FailedCleanupStore>,
    resolve_on_success: bool,
}

impl FailureRecorder {
    pub fn new(workflow_id: impl Into<String>, store: Arc<dyn FailedCleanupStore>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            store,
            resolve_on_success: false,
        }
    }

    /// Also delete the open record of every step that succeeds.
    pub fn resolving_on_success(mut self) -> Self {
        self.resolve_on_success = true;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    async fn resolve(&self, step: &CleanupStepSpec) {
        match self.store.resolve(&self.workflow_id, &step.name).await {
            Ok(0) => {}
            Ok(resolved) => info!(workflow_id = %self.workflow_id, step = %step.name, resolved, "failed cleanup resolved"),
            Err(store_error) => warn!(
                workflow_id = %self.workflow_id,
                step = %step.name,
                error = %store_error,
                "could not resolve failed cleanup"
            ),
        }
    }

    async fn record(&self, step: &CleanupStepSpec, cause: &CleanupError) {
        let record = FailedCleanupRecord::pending(&self.workflow_id, step, cause.to_string(), Utc::now());
        match self.store.record_failure(record).await {
            Ok(id) => info!(workflow_id = %self.workflow_id, step = %step.name, record_id = %id, "recorded failed cleanup"),
            Err(store_error) => error!(
                workflow_id = %self.workflow_id,
                step = %step.name,
                error = %store_error,
                "could not record failed cleanup"
            ),
        }
    }
}

/// A step that never succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_name: String,
    pub step_type: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: Vec<StepFailure>,
}

impl SagaReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupSaga {
    steps: Vec<CleanupStepSpec>,
    #[serde(skip)]
    backoff_unit: Option<Duration>,
}

impl CleanupSaga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<CleanupStepSpec>) -> Self {
        Self {
            steps,
            backoff_unit: None,
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = Some(unit);
        self
    }

    pub fn push(&mut self, step: CleanupStepSpec) {
        self.steps.push(step);
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[CleanupStepSpec] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The steps that are safe to run a second time.
    pub fn idempotent_only(&self) -> CleanupSaga {
        let (steps, skipped): (Vec<_>, Vec<_>) = self.steps.iter().cloned().partition(|step| step.idempotent);
        for step in &skipped {
            debug!(step = %step.name, step_type = %step.step_type, "not re-running non-idempotent cleanup step");
        }
        CleanupSaga {
            steps,
            backoff_unit: self.backoff_unit,
        }
    }

    /// Execute every step in reverse declaration order.
    pub async fn run(&self, actions: &CleanupActionRegistry, on_failure: Option<&FailureRecorder>) -> SagaReport {
        let mut report = SagaReport::default();
        let unit = self.backoff_unit.unwrap_or(DEFAULT_BACKOFF_UNIT);

        for step in self.steps.iter().rev() {
            report.attempted += 1;
            match run_step(actions, step, unit).await {
                Ok(attempts) => {
                    info!(step = %step.name, step_type = %step.step_type, attempts, "cleanup step succeeded");
                    if let Some(recorder) = on_failure.filter(|recorder| recorder.resolve_on_success) {
                        recorder.resolve(step).await;
                    }
                    report.succeeded += 1;
                }
                Err((attempts, cause)) => {
                    error!(step = %step.name, step_type = %step.step_type, attempts, error = %cause, "cleanup step failed");
                    if let Some(recorder) = on_failure {
                        recorder.record(step, &cause).await;
                    }
                    report.errors.push(StepFailure {
                        step_name: step.name.clone(),
                        step_type: step.step_type.clone(),
                        attempts,
                        error: cause.to_string(),
                    });
                }
            }
        }

        if !report.is_clean() {
            warn!(
                attempted = report.attempted,
                failed = report.errors.len(),
                "cleanup saga finished with failures"
            );
        }
        report
    }
}

/// Delay before the attempt following attempt `attempt` (1-based).
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

async fn run_step(actions: &CleanupActionRegistry, step: &CleanupStepSpec, unit: Duration) -> Result<u32, (u32, CleanupError)> {
    let max_attempts = step.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match actions.execute(step).await {
            Ok(()) => return Ok(attempt),
            Err(cause @ CleanupError::UnknownStepType { .. }) | Err(cause @ CleanupError::InvalidPayload { .. }) => {
                return Err((attempt, cause));
            }
            Err(cause) if attempt >= max_attempts => return Err((attempt, cause)),
            Err(cause) => {
                let delay = backoff_delay(unit, attempt);
                warn!(step = %step.name, attempt, delay_ms = delay.as_millis() as u64, error = %cause, "cleanup attempt failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
