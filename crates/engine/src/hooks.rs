//! Setup and cleanup hook chains.
//!
//! Setup hooks run once over the full step list before the first step and
//! may rewrite step inputs in place. Cleanup hooks run after the last step,
//! whatever the outcome, on a task detached from the run's cancellation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use runlane_admission::TicketCoordinator;
use runlane_api::{ApiError, HostClient, PipelineExecutionResult, RecordStoreClient};
use runlane_cleanup::{CleanupActionRegistry, FailedCleanupStore, FailureRecorder, schedule_verification};
use runlane_types::{PayloadValue, RunStatus, StepDefinition};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::PipelineError, run::RunData, run::RunInfo};

/// Steps whose `use` starts with this prefix run on an admitted runner.
pub const MOBILE_TASK_PREFIX: &str = "mobile/";
/// Optional payload key selecting one of the ticket's runners.
pub const RUNNER_KEY: &str = "runner";

/// How a run ended, as seen by cleanup hooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub run: RunInfo,
    pub succeeded: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Final or partial step outputs.
    pub outputs: JsonMap<String, Value>,
}

impl RunReport {
    pub fn new(run: &RunInfo, result: &Result<JsonMap<String, Value>, PipelineError>) -> Self {
        match result {
            Ok(outputs) => Self {
                run: run.clone(),
                succeeded: true,
                outputs: outputs.clone(),
                ..Default::default()
            },
            Err(error) => Self {
                run: run.clone(),
                succeeded: false,
                error: Some(error.to_string()),
                error_code: Some(error.code().to_string()),
                outputs: error.partial_outputs().cloned().unwrap_or_default(),
            },
        }
    }
}

#[async_trait]
pub trait SetupHook: Send + Sync {
    fn name(&self) -> &str;

    async fn setup(&self, steps: &mut Vec<StepDefinition>, data: &RunData) -> Result<(), PipelineError>;
}

/// Errors returned by a cleanup hook are logged and never change the run result.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> &str;

    async fn cleanup(&self, report: &RunReport, data: &RunData, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Maps runner references (`owner/runner-name` or ids) to runner ids.
#[async_trait]
pub trait RunnerDirectory: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<String, ApiError>;
}

/// Fixed alias table; unknown references resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticRunnerDirectory {
    aliases: HashMap<String, String>,
}

impl StaticRunnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, reference: impl Into<String>, runner_id: impl Into<String>) -> Self {
        self.aliases.insert(reference.into(), runner_id.into());
        self
    }
}

#[async_trait]
impl RunnerDirectory for StaticRunnerDirectory {
    async fn resolve(&self, reference: &str) -> Result<String, ApiError> {
        let reference = reference.trim();
        Ok(self.aliases.get(reference).cloned().unwrap_or_else(|| reference.to_string()))
    }
}

/// Looks runners up in the record store's runner collection.
#[derive(Debug, Clone)]
pub struct RecordStoreRunnerDirectory {
    client: RecordStoreClient,
    collection: String,
}

impl RecordStoreRunnerDirectory {
    pub const DEFAULT_COLLECTION: &'static str = "runners";

    pub fn new(client: RecordStoreClient) -> Self {
        Self {
            client,
            collection: Self::DEFAULT_COLLECTION.into(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }
}

#[async_trait]
impl RunnerDirectory for RecordStoreRunnerDirectory {
    async fn resolve(&self, reference: &str) -> Result<String, ApiError> {
        let record = self.client.find_runner(&self.collection, reference.trim()).await?;
        Ok(record.id)
    }
}

/// Confirms the run still holds its runners and stamps their ids into mobile steps.
///
/// Runs without a ticket are left alone. Each `mobile/` step gets
/// `runner_id` (its `runner` payload reference, or the ticket's leader),
/// `runner_ids`, and `version_id` when the ticket carries one.
pub struct RunnerAdmissionHook {
    coordinator: TicketCoordinator,
    directory: Arc<dyn RunnerDirectory>,
}

impl RunnerAdmissionHook {
    pub fn new(coordinator: TicketCoordinator, directory: Arc<dyn RunnerDirectory>) -> Self {
        Self { coordinator, directory }
    }

    fn fail(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::hook(self.name(), message)
    }
}

#[async_trait]
impl SetupHook for RunnerAdmissionHook {
    fn name(&self) -> &str {
        "runner-admission"
    }

    async fn setup(&self, steps: &mut Vec<StepDefinition>, data: &RunData) -> Result<(), PipelineError> {
        let Some(ticket) = data.ticket() else {
            return Ok(());
        };

        let view = self
            .coordinator
            .status(&ticket.ticket_id, &ticket.owner_namespace, &ticket.required_runner_ids)
            .await
            .map_err(|error| self.fail(format!("admission status for ticket '{}': {error}", ticket.ticket_id)))?;
        if !matches!(view.status, RunStatus::Starting | RunStatus::Running) {
            return Err(self.fail(format!(
                "ticket '{}' is {}, not admitted",
                ticket.ticket_id,
                view.status.as_str()
            )));
        }

        let version_id = ticket
            .memo
            .get("version_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ticket.pipeline_config.get("version_id").cloned());
        let runner_ids = Value::Array(ticket.required_runner_ids.iter().cloned().map(Value::String).collect());

        for step in steps.iter_mut().filter(|step| step.uses.starts_with(MOBILE_TASK_PREFIX)) {
            let runner_id = match step.with.payload.get(RUNNER_KEY).map(PayloadValue::raw) {
                Some(Value::String(reference)) if !reference.trim().is_empty() => {
                    let runner_id = self
                        .directory
                        .resolve(reference)
                        .await
                        .map_err(|error| self.fail(format!("step '{}': resolve runner '{reference}': {error}", step.id)))?;
                    if !ticket.required_runner_ids.contains(&runner_id) {
                        return Err(self.fail(format!(
                            "step '{}': runner '{reference}' ({runner_id}) is not held by ticket '{}'",
                            step.id, ticket.ticket_id
                        )));
                    }
                    runner_id
                }
                _ => ticket.leader_runner_id.clone(),
            };
            debug!(step_id = %step.id, runner_id = %runner_id, "stamping runner into step");

            let payload = &mut step.with.payload;
            payload.insert("runner_id".into(), PayloadValue::Plain(Value::String(runner_id)));
            payload.insert("runner_ids".into(), PayloadValue::Plain(runner_ids.clone()));
            if let Some(version_id) = &version_id {
                payload.insert("version_id".into(), PayloadValue::Plain(Value::String(version_id.clone())));
            }
        }

        data.set_value("runner_ids", runner_ids);
        data.set_value("leader_runner_id", Value::String(ticket.leader_runner_id.clone()));
        if let Some(version_id) = version_id {
            data.set_value("version_id", Value::String(version_id));
        }
        info!(ticket_id = %ticket.ticket_id, status = view.status.as_str(), "run admission confirmed");
        Ok(())
    }
}

/// Runs the compensating steps the run accumulated, newest first.
pub struct CleanupSagaHook {
    actions: Arc<CleanupActionRegistry>,
    store: Option<Arc<dyn FailedCleanupStore>>,
    verification_delay: Option<Duration>,
}

impl CleanupSagaHook {
    pub fn new(actions: Arc<CleanupActionRegistry>) -> Self {
        Self {
            actions,
            store: None,
            verification_delay: None,
        }
    }

    /// Persist steps that exhaust their retries.
    pub fn with_store(mut self, store: Arc<dyn FailedCleanupStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Re-run the idempotent steps once after `delay` when a step failed.
    pub fn with_verification(mut self, delay: Duration) -> Self {
        self.verification_delay = Some(delay);
        self
    }
}

#[async_trait]
impl CleanupHook for CleanupSagaHook {
    fn name(&self) -> &str {
        "cleanup-saga"
    }

    async fn cleanup(&self, report: &RunReport, data: &RunData, cancel: &CancellationToken) -> anyhow::Result<()> {
        let saga = data.cleanup_saga();
        if saga.is_empty() {
            debug!(workflow_id = %report.run.workflow_id, "no cleanup steps registered");
            return Ok(());
        }

        let recorder = self
            .store
            .clone()
            .map(|store| FailureRecorder::new(report.run.workflow_id.clone(), store));
        let outcome = saga.run(&self.actions, recorder.as_ref()).await;
        info!(
            workflow_id = %report.run.workflow_id,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.errors.len(),
            "cleanup saga finished"
        );

        if !outcome.is_clean()
            && let Some(delay) = self.verification_delay
        {
            debug!(workflow_id = %report.run.workflow_id, delay = ?delay, "scheduling cleanup verification");
            let _verification = schedule_verification(delay, saga, self.actions.clone(), recorder, cancel.clone());
        }
        Ok(())
    }
}

/// Reports the run finished to every runner its ticket holds.
pub struct RunReleaseHook {
    coordinator: TicketCoordinator,
}

impl RunReleaseHook {
    pub fn new(coordinator: TicketCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl CleanupHook for RunReleaseHook {
    fn name(&self) -> &str {
        "run-release"
    }

    async fn cleanup(&self, report: &RunReport, data: &RunData, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let Some(ticket) = data.ticket() else {
            return Ok(());
        };
        let view = self
            .coordinator
            .release(
                &ticket.ticket_id,
                &ticket.owner_namespace,
                &ticket.required_runner_ids,
                &report.run.workflow_id,
                &report.run.run_id,
            )
            .await
            .with_context(|| format!("release ticket '{}'", ticket.ticket_id))?;
        info!(ticket_id = %ticket.ticket_id, status = view.status.as_str(), "runners released");
        Ok(())
    }
}

/// Posts the execution result to the hosting application.
pub struct ResultCallbackHook {
    host: HostClient,
}

impl ResultCallbackHook {
    pub fn new(host: HostClient) -> Self {
        Self { host }
    }
}

#[async_trait]
impl CleanupHook for ResultCallbackHook {
    fn name(&self) -> &str {
        "result-callback"
    }

    async fn cleanup(&self, report: &RunReport, data: &RunData, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let owner = data
            .ticket()
            .map(|ticket| ticket.owner_namespace.clone())
            .unwrap_or_else(|| report.run.namespace.clone());
        let result = PipelineExecutionResult {
            owner,
            pipeline_id: report.run.pipeline_id.clone(),
            workflow_id: report.run.workflow_id.clone(),
            run_id: report.run.run_id.clone(),
        };
        if let Err(error) = self.host.post_execution_result(&result).await {
            warn!(workflow_id = %result.workflow_id, error = %error, "execution result callback failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use chrono::Utc;
    use runlane_admission::{AdmissionError, SemaphoreClient};
    use runlane_cleanup::{CleanupAction, CleanupError, MemoryFailedCleanupStore};
    use runlane_types::{CleanupStepSpec, RunStatusView, RunTicketRequest, StepInputs};
    use serde_json::json;

    use super::*;

    /// Answers every call with a fixed status and records run-done calls.
    struct FixedClient {
        status: RunStatus,
        done: Mutex<Vec<String>>,
    }

    impl FixedClient {
        fn new(status: RunStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                done: Mutex::new(Vec::new()),
            })
        }

        fn view(&self, ticket_id: &str, status: RunStatus) -> RunStatusView {
            RunStatusView {
                ticket_id: ticket_id.into(),
                owner_namespace: "acme".into(),
                status,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SemaphoreClient for FixedClient {
        async fn ensure_started(&self, _: &str) -> Result<(), AdmissionError> {
            Ok(())
        }

        async fn enqueue(&self, _: &str, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError> {
            Ok(self.view(&request.ticket_id, RunStatus::Queued))
        }

        async fn cancel(&self, _: &str, ticket_id: &str, _: &str, _: Option<&str>) -> Result<RunStatusView, AdmissionError> {
            Ok(self.view(ticket_id, RunStatus::Canceled))
        }

        async fn run_done(&self, runner_id: &str, ticket_id: &str, _: &str, _: &str, _: &str) -> Result<RunStatusView, AdmissionError> {
            self.done.lock().unwrap().push(runner_id.to_string());
            Ok(self.view(ticket_id, RunStatus::Done))
        }

        async fn status(&self, _: &str, _: &str, ticket_id: &str) -> Result<RunStatusView, AdmissionError> {
            Ok(self.view(ticket_id, self.status))
        }

        async fn list(&self, _: &str) -> Result<Vec<RunStatusView>, AdmissionError> {
            Ok(Vec::new())
        }
    }

    fn ticket() -> RunTicketRequest {
        let mut memo = JsonMap::new();
        memo.insert("version_id".into(), json!("v-9"));
        RunTicketRequest {
            ticket_id: "t-1".into(),
            owner_namespace: "acme".into(),
            enqueued_at: Utc::now(),
            required_runner_ids: vec!["r1".into(), "r2".into()],
            leader_runner_id: "r1".into(),
            max_queue_depth: 0,
            pipeline_id: "pipe".into(),
            pipeline_source: String::new(),
            pipeline_config: Default::default(),
            memo,
        }
    }

    fn step(id: &str, uses: &str, payload: Vec<(&str, Value)>) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            uses: uses.into(),
            with: StepInputs {
                payload: payload.into_iter().map(|(key, value)| (key.to_string(), value.into())).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn admission_hook(status: RunStatus) -> RunnerAdmissionHook {
        let directory = StaticRunnerDirectory::new().with_alias("acme/pixel-8", "r2");
        RunnerAdmissionHook::new(TicketCoordinator::new(FixedClient::new(status)), Arc::new(directory))
    }

    #[tokio::test]
    async fn stamps_runners_into_mobile_steps_only() {
        let data = RunData::new(RunInfo::default(), Some(ticket()));
        let mut steps = vec![
            step("boot", "mobile/session", Vec::new()),
            step("second", "mobile/session", vec![("runner", json!("acme/pixel-8"))]),
            step("echo", "core/echo", Vec::new()),
        ];
        admission_hook(RunStatus::Running).setup(&mut steps, &data).await.expect("setup");

        assert_eq!(steps[0].with.payload["runner_id"].raw(), &json!("r1"));
        assert_eq!(steps[1].with.payload["runner_id"].raw(), &json!("r2"));
        assert_eq!(steps[1].with.payload["runner_ids"].raw(), &json!(["r1", "r2"]));
        assert_eq!(steps[0].with.payload["version_id"].raw(), &json!("v-9"));
        assert!(steps[2].with.payload.is_empty());
        assert_eq!(data.value("leader_runner_id"), Some(json!("r1")));
    }

    #[tokio::test]
    async fn rejects_runner_outside_the_ticket() {
        let data = RunData::new(RunInfo::default(), Some(ticket()));
        let mut steps = vec![step("boot", "mobile/session", vec![("runner", json!("r7"))])];
        let error = admission_hook(RunStatus::Running)
            .setup(&mut steps, &data)
            .await
            .expect_err("foreign runner");
        assert_eq!(error.code(), "HOOK_FAILED");
    }

    #[tokio::test]
    async fn refuses_tickets_that_are_not_admitted() {
        let data = RunData::new(RunInfo::default(), Some(ticket()));
        let error = admission_hook(RunStatus::Queued)
            .setup(&mut Vec::new(), &data)
            .await
            .expect_err("still queued");
        assert!(error.to_string().contains("is queued"), "{error}");
    }

    #[tokio::test]
    async fn runs_without_ticket_skip_admission() {
        let data = RunData::new(RunInfo::default(), None);
        let mut steps = vec![step("boot", "mobile/session", Vec::new())];
        admission_hook(RunStatus::NotFound).setup(&mut steps, &data).await.expect("setup");
        assert!(steps[0].with.payload.is_empty());
    }

    #[tokio::test]
    async fn release_hook_reports_done_on_every_runner() {
        let client = FixedClient::new(RunStatus::Running);
        let hook = RunReleaseHook::new(TicketCoordinator::new(client.clone()));
        let data = RunData::new(RunInfo::default(), Some(ticket()));
        hook.cleanup(&RunReport::default(), &data, &CancellationToken::new())
            .await
            .expect("release");
        assert_eq!(*client.done.lock().unwrap(), vec!["r1", "r2"]);
    }

    struct AlwaysFails;

    #[async_trait]
    impl CleanupAction for AlwaysFails {
        async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
            Err(CleanupError::Action {
                step: step.name.clone(),
                message: "device offline".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn saga_hook_records_failed_steps() {
        let actions = Arc::new(CleanupActionRegistry::new().register("stop-emulator", Arc::new(AlwaysFails)));
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let hook = CleanupSagaHook::new(actions).with_store(store.clone());

        let run = RunInfo {
            workflow_id: "wf-1".into(),
            ..Default::default()
        };
        let data = RunData::new(run.clone(), None);
        data.push_cleanup(CleanupStepSpec::new("stop emulator", "stop-emulator", json!({})).with_max_retries(1));
        let report = RunReport {
            run,
            ..Default::default()
        };
        hook.cleanup(&report, &data, &CancellationToken::new()).await.expect("cleanup");

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workflow_id, "wf-1");
        assert_eq!(records[0].step_name, "stop emulator");
    }

    /// Fails its first attempt only.
    #[derive(Default)]
    struct FailsOnce {
        failed: AtomicBool,
    }

    #[async_trait]
    impl CleanupAction for FailsOnce {
        async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
            if self.failed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            Err(CleanupError::action(&step.name, "device busy"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn verification_clears_the_recorded_failure() {
        let actions = Arc::new(CleanupActionRegistry::new().register("stop-emulator", Arc::new(FailsOnce::default())));
        let store = Arc::new(MemoryFailedCleanupStore::new());
        let delay = Duration::from_secs(60);
        let hook = CleanupSagaHook::new(actions).with_store(store.clone()).with_verification(delay);

        let run = RunInfo {
            workflow_id: "wf-2".into(),
            ..Default::default()
        };
        let data = RunData::new(run.clone(), None);
        data.push_cleanup(CleanupStepSpec::new("stop emulator", "stop-emulator", json!({})).with_max_retries(1));
        let report = RunReport {
            run,
            ..Default::default()
        };
        hook.cleanup(&report, &data, &CancellationToken::new()).await.expect("cleanup");
        assert_eq!(store.records().len(), 1);

        tokio::time::sleep(delay * 2).await;
        assert!(store.records().is_empty());
    }
}
