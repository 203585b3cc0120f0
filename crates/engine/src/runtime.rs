//! Timeout and retry handling around a single activity.

use std::time::Duration;

use runlane_types::ActivityOptions;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::activity::{Activity, ActivityError, ActivityInput};

/// Invokes activities with the configured options.
#[derive(Debug, Clone, Default)]
pub struct ActivityRuntime {
    defaults: ActivityOptions,
}

impl ActivityRuntime {
    pub fn new(defaults: ActivityOptions) -> Self {
        Self { defaults }
    }

    /// Options applied underneath pipeline and step settings.
    pub fn defaults(&self) -> &ActivityOptions {
        &self.defaults
    }

    /// Run `activity` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Each attempt is bounded by `start_to_close_timeout`; all attempts and
    /// backoff sleeps together by `schedule_to_close_timeout`. Retrying stops
    /// on non-retryable errors, on codes listed in the policy's
    /// `non_retryable_errors`, and on cancellation.
    pub async fn invoke(
        &self,
        step_id: &str,
        activity: &dyn Activity,
        input: &ActivityInput,
        options: &ActivityOptions,
        cancel: &CancellationToken,
    ) -> Result<Value, ActivityError> {
        let options = options.layered_over(&self.defaults);
        let policy = options.retry_policy();
        let deadline = options.schedule_to_close_timeout.map(|budget| Instant::now() + budget);
        let mut attempt: u32 = 1;

        loop {
            let attempt_timeout = attempt_timeout(options.start_to_close_timeout, deadline);
            debug!(step_id, activity = activity.name(), attempt, "starting activity attempt");

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ActivityError::Canceled),
                outcome = run_attempt(activity, input, cancel, attempt_timeout) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let stop = !error.is_retryable()
                || policy.non_retryable_errors.iter().any(|code| code == error.code())
                || !policy.allows_attempt_after(attempt);
            if stop {
                warn!(step_id, activity = activity.name(), attempt, error = %error, "activity failed");
                return Err(error);
            }

            let delay = policy.delay_after(attempt);
            if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                warn!(step_id, activity = activity.name(), attempt, error = %error, "activity out of schedule-to-close budget");
                return Err(error);
            }
            warn!(
                step_id,
                activity = activity.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "activity attempt failed; retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ActivityError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn attempt_timeout(start_to_close: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
    match (start_to_close, remaining) {
        (Some(limit), Some(remaining)) => Some(limit.min(remaining)),
        (limit, remaining) => limit.or(remaining),
    }
}

async fn run_attempt(
    activity: &dyn Activity,
    input: &ActivityInput,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<Value, ActivityError> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, activity.execute(input, cancel))
            .await
            .unwrap_or(Err(ActivityError::Timeout { timeout })),
        None => activity.execute(input, cancel).await,
    }
}
