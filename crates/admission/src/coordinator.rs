//! Multi-runner ticket coordination.
//!
//! Enqueueing a ticket on several runners is a sequence of independent,
//! individually serialized updates. A failure part-way through is rolled back
//! by cancelling the ticket on every runner that already accepted it.

use std::{collections::BTreeSet, sync::Arc};

use futures_util::future::join_all;
use runlane_types::{RunStatusView, RunTicketRequest, ValidationErrors};
use tracing::{debug, info, warn};

use crate::{aggregate::aggregate_runner_statuses, error::AdmissionError, hub::SemaphoreClient};

/// Cancel reason recorded when a partial enqueue is undone.
pub const ROLLBACK_REASON: &str = "enqueue rolled back";

#[derive(Clone)]
pub struct TicketCoordinator {
    client: Arc<dyn SemaphoreClient>,
}

impl TicketCoordinator {
    pub fn new(client: Arc<dyn SemaphoreClient>) -> Self {
        Self { client }
    }

    /// Admit a ticket onto every runner it requires.
    ///
    /// Queue-limit errors propagate unchanged; every other failure after
    /// validation is reported as [`AdmissionError::Execution`].
    pub async fn enqueue(&self, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError> {
        let request = normalize_ticket(request)?;
        let runners = request.required_runner_ids.clone();

        for runner_id in &runners {
            self.client
                .ensure_started(runner_id)
                .await
                .map_err(|error| AdmissionError::execution(format!("start semaphore for runner '{runner_id}': {error}")))?;
        }

        let mut admitted: Vec<String> = Vec::with_capacity(runners.len());
        let mut views = Vec::with_capacity(runners.len());
        for runner_id in &runners {
            match self.client.enqueue(runner_id, request.clone()).await {
                Ok(view) => {
                    debug!(ticket_id = %request.ticket_id, runner_id = %runner_id, status = view.status.as_str(), "runner accepted ticket");
                    admitted.push(runner_id.clone());
                    views.push(view);
                }
                Err(error) => {
                    warn!(
                        ticket_id = %request.ticket_id,
                        runner_id = %runner_id,
                        error = %error,
                        admitted = admitted.len(),
                        "enqueue failed; rolling back"
                    );
                    self.rollback(&request, &admitted).await;
                    return Err(match error {
                        limit @ AdmissionError::QueueLimitExceeded { .. } => limit,
                        other => AdmissionError::execution(format!("enqueue on runner '{runner_id}': {other}")),
                    });
                }
            }
        }

        let aggregate = aggregate_runner_statuses(&views);
        info!(
            ticket_id = %request.ticket_id,
            leader = %request.leader_runner_id,
            runners = runners.len(),
            status = aggregate.status.as_str(),
            "ticket enqueued"
        );
        Ok(aggregate)
    }

    /// Cancel a ticket on every listed runner. `not_found` answers are fine.
    pub async fn cancel(
        &self,
        ticket_id: &str,
        owner_namespace: &str,
        runner_ids: &[String],
        reason: Option<&str>,
    ) -> Result<RunStatusView, AdmissionError> {
        let mut views = Vec::new();
        let mut failures = Vec::new();
        for runner_id in runner_ids {
            match self.client.cancel(runner_id, ticket_id, owner_namespace, reason).await {
                Ok(view) => views.push(view),
                Err(error) => failures.push(format!("{runner_id}: {error}")),
            }
        }
        finish_fan_out("cancel", ticket_id, views, failures)
    }

    /// Report the run finished on every listed runner, releasing their slots.
    pub async fn release(
        &self,
        ticket_id: &str,
        owner_namespace: &str,
        runner_ids: &[String],
        workflow_id: &str,
        run_id: &str,
    ) -> Result<RunStatusView, AdmissionError> {
        let mut views = Vec::new();
        let mut failures = Vec::new();
        for runner_id in runner_ids {
            match self
                .client
                .run_done(runner_id, ticket_id, owner_namespace, workflow_id, run_id)
                .await
            {
                Ok(view) => views.push(view),
                Err(error) => failures.push(format!("{runner_id}: {error}")),
            }
        }
        finish_fan_out("release", ticket_id, views, failures)
    }

    /// Aggregated status of a ticket across its runners.
    pub async fn status(&self, ticket_id: &str, owner_namespace: &str, runner_ids: &[String]) -> Result<RunStatusView, AdmissionError> {
        let answers = join_all(
            runner_ids
                .iter()
                .map(|runner_id| self.client.status(runner_id, owner_namespace, ticket_id)),
        )
        .await;
        let views = answers.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(aggregate_runner_statuses(&views))
    }

    async fn rollback(&self, request: &RunTicketRequest, admitted: &[String]) {
        for runner_id in admitted {
            match self
                .client
                .cancel(runner_id, &request.ticket_id, &request.owner_namespace, Some(ROLLBACK_REASON))
                .await
            {
                Ok(view) => debug!(ticket_id = %request.ticket_id, runner_id = %runner_id, status = view.status.as_str(), "rolled back"),
                Err(error) => warn!(ticket_id = %request.ticket_id, runner_id = %runner_id, error = %error, "rollback cancel failed"),
            }
        }
    }
}

fn finish_fan_out(
    operation: &str,
    ticket_id: &str,
    views: Vec<RunStatusView>,
    failures: Vec<String>,
) -> Result<RunStatusView, AdmissionError> {
    if failures.is_empty() {
        return Ok(aggregate_runner_statuses(&views));
    }
    warn!(ticket_id, operation, failures = failures.len(), "some runners did not answer");
    Err(AdmissionError::execution(format!("{operation} ticket '{ticket_id}': {}", failures.join("; "))))
}

/// Validate a ticket and normalize its runner set.
///
/// Runner ids are trimmed, blanks dropped, de-duplicated, and sorted. The
/// leader defaults to the first runner and must be one of them.
pub fn normalize_ticket(mut request: RunTicketRequest) -> Result<RunTicketRequest, AdmissionError> {
    let mut errors = ValidationErrors::new();
    errors.require_non_empty("ticket_id", &request.ticket_id);
    errors.require_non_empty("owner_namespace", &request.owner_namespace);
    errors.require_non_empty("pipeline_id", &request.pipeline_id);
    errors.require_non_empty("pipeline_source", &request.pipeline_source);

    let runners: BTreeSet<String> = request
        .required_runner_ids
        .iter()
        .map(|runner| runner.trim())
        .filter(|runner| !runner.is_empty())
        .map(str::to_string)
        .collect();
    if runners.is_empty() {
        errors.push("required_runner_ids", "at least one runner is required");
    }
    request.required_runner_ids = runners.into_iter().collect();

    let leader = request.leader_runner_id.trim().to_string();
    request.leader_runner_id = if leader.is_empty() {
        request.required_runner_ids.first().cloned().unwrap_or_default()
    } else {
        leader
    };
    if !request.required_runner_ids.is_empty() && !request.required_runner_ids.contains(&request.leader_runner_id) {
        errors.push("leader_runner_id", "must be one of the required runners");
    }

    errors
        .into_result(())
        .map_err(|errors| AdmissionError::invalid(errors.to_string()))?;
    request.ticket_id = request.ticket_id.trim().to_string();
    request.owner_namespace = request.owner_namespace.trim().to_string();
    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use runlane_types::RunStatus;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(String),
        Enqueue(String, Vec<String>, String),
        Cancel(String, String),
    }

    #[derive(Default)]
    struct FakeClient {
        calls: Mutex<Vec<Call>>,
        fail_enqueue_on: Option<(String, AdmissionError)>,
    }

    impl FakeClient {
        fn failing(runner_id: &str, error: AdmissionError) -> Self {
            Self {
                calls: Mutex::default(),
                fail_enqueue_on: Some((runner_id.into(), error)),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SemaphoreClient for FakeClient {
        async fn ensure_started(&self, runner_id: &str) -> Result<(), AdmissionError> {
            self.calls.lock().unwrap().push(Call::Start(runner_id.into()));
            Ok(())
        }

        async fn enqueue(&self, runner_id: &str, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError> {
            self.calls.lock().unwrap().push(Call::Enqueue(
                runner_id.into(),
                request.required_runner_ids.clone(),
                request.leader_runner_id.clone(),
            ));
            if let Some((failing, error)) = &self.fail_enqueue_on
                && failing == runner_id
            {
                return Err(error.clone());
            }
            Ok(RunStatusView {
                ticket_id: request.ticket_id,
                status: RunStatus::Queued,
                position: 1,
                line_len: 1,
                ..Default::default()
            })
        }

        async fn cancel(
            &self,
            runner_id: &str,
            ticket_id: &str,
            _owner_namespace: &str,
            _reason: Option<&str>,
        ) -> Result<RunStatusView, AdmissionError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Cancel(runner_id.into(), ticket_id.into()));
            Ok(RunStatusView::not_found(ticket_id, ""))
        }

        async fn run_done(&self, _: &str, ticket_id: &str, _: &str, _: &str, _: &str) -> Result<RunStatusView, AdmissionError> {
            Ok(RunStatusView::not_found(ticket_id, ""))
        }

        async fn status(&self, _: &str, _: &str, ticket_id: &str) -> Result<RunStatusView, AdmissionError> {
            Ok(RunStatusView::not_found(ticket_id, ""))
        }

        async fn list(&self, _: &str) -> Result<Vec<RunStatusView>, AdmissionError> {
            Ok(Vec::new())
        }
    }

    fn ticket(runners: &[&str]) -> RunTicketRequest {
        RunTicketRequest {
            ticket_id: "t1".into(),
            owner_namespace: "acme".into(),
            enqueued_at: Utc::now(),
            required_runner_ids: runners.iter().map(|runner| runner.to_string()).collect(),
            leader_runner_id: String::new(),
            max_queue_depth: 0,
            pipeline_id: "pipe".into(),
            pipeline_source: "name: pipe".into(),
            pipeline_config: Default::default(),
            memo: Default::default(),
        }
    }

    #[tokio::test]
    async fn enqueues_once_per_runner_with_identical_request() {
        let client = Arc::new(FakeClient::default());
        let coordinator = TicketCoordinator::new(client.clone());
        coordinator.enqueue(ticket(&["r2", " r1", "r2", ""])).await.expect("enqueue");

        let runners = vec!["r1".to_string(), "r2".to_string()];
        let enqueues: Vec<Call> = client
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Enqueue(..)))
            .collect();
        assert_eq!(
            enqueues,
            vec![
                Call::Enqueue("r1".into(), runners.clone(), "r1".into()),
                Call::Enqueue("r2".into(), runners, "r1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn infrastructure_failure_cancels_admitted_runners() {
        let client = Arc::new(FakeClient::failing("r2", AdmissionError::unavailable("runner-semaphore/r2", "down")));
        let coordinator = TicketCoordinator::new(client.clone());
        let error = coordinator.enqueue(ticket(&["r1", "r2"])).await.expect_err("fails");

        assert!(matches!(error, AdmissionError::Execution { .. }));
        let calls = client.calls();
        assert_eq!(calls.last(), Some(&Call::Cancel("r1".into(), "t1".into())));
    }

    #[tokio::test]
    async fn queue_limit_propagates_unchanged() {
        let limit = AdmissionError::QueueLimitExceeded {
            runner_id: "r2".into(),
            line_len: 5,
            limit: 5,
        };
        let client = Arc::new(FakeClient::failing("r2", limit.clone()));
        let coordinator = TicketCoordinator::new(client.clone());
        let error = coordinator.enqueue(ticket(&["r1", "r2"])).await.expect_err("full");

        assert_eq!(error, limit);
        assert!(client.calls().contains(&Call::Cancel("r1".into(), "t1".into())));
    }

    #[tokio::test]
    async fn validation_failure_touches_no_runner() {
        let client = Arc::new(FakeClient::default());
        let coordinator = TicketCoordinator::new(client.clone());
        let mut request = ticket(&[" ", ""]);
        request.pipeline_source.clear();

        let error = coordinator.enqueue(request).await.expect_err("invalid");
        let AdmissionError::InvalidRequest { message } = error else {
            panic!("expected invalid request");
        };
        assert!(message.contains("pipeline_source"));
        assert!(message.contains("required_runner_ids"));
        assert!(client.calls().is_empty());
    }

    #[test]
    fn explicit_leader_must_be_required() {
        let mut request = ticket(&["r1", "r2"]);
        request.leader_runner_id = "r2".into();
        assert_eq!(normalize_ticket(request).expect("valid").leader_runner_id, "r2");

        let mut request = ticket(&["r1"]);
        request.leader_runner_id = "r9".into();
        assert!(normalize_ticket(request).is_err());
    }
}
