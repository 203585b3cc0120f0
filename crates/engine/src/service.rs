//! Pipeline submission and the run launcher used by leader semaphores.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use runlane_admission::{AdmissionError, RunLauncher, TicketCoordinator};
use runlane_api::{ApiError, HostClient};
use runlane_cleanup::{CleanupActionRegistry, FailedCleanupStore};
use runlane_types::{RunIdentity, RunStatusView, RunTicketRequest, ValidationErrors, WorkflowDefinition};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    hooks::{CleanupSagaHook, ResultCallbackHook, RunReleaseHook, RunnerAdmissionHook, RunnerDirectory},
    model::parse_pipeline,
    orchestrator::Orchestrator,
    registry::TaskRegistry,
    run::{RunInfo, RunInput},
    runtime::ActivityRuntime,
};

/// Memo key whose map becomes the run payload when a ticket is launched.
pub const PAYLOAD_MEMO_KEY: &str = "payload";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid pipeline: {0}")]
    Invalid(ValidationErrors),

    /// Queue-limit rejections pass through unchanged.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("could not resolve runner '{reference}': {source}")]
    Directory {
        reference: String,
        #[source]
        source: ApiError,
    },
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Invalid(_) => "INVALID_PIPELINE",
            ServiceError::Admission(error) => error.code(),
            ServiceError::Directory { .. } => "RUNNER_NOT_FOUND",
        }
    }
}

/// What happened to a submitted pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    /// Runner-less pipeline, already running.
    Started(RunIdentity),
    /// Mobile-runner pipeline, waiting for its runners.
    Queued(RunStatusView),
}

/// Accepts pipelines and starts their runs.
///
/// Runner-less pipelines start at once. Pipelines that list runners become a
/// ticket; the leader runner's semaphore later calls [`RunLauncher::launch`]
/// once every runner granted it.
pub struct PipelineService {
    orchestrator: Orchestrator,
    coordinator: TicketCoordinator,
    directory: Arc<dyn RunnerDirectory>,
    namespace: String,
    max_queue_depth: usize,
    runs: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineService {
    pub fn new(orchestrator: Orchestrator, coordinator: TicketCoordinator, directory: Arc<dyn RunnerDirectory>) -> Self {
        Self {
            orchestrator,
            coordinator,
            directory,
            namespace: "default".into(),
            max_queue_depth: 0,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Namespace for pipelines that do not name their own.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Queue-depth limit stamped on new tickets; 0 means unlimited.
    pub fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    pub fn coordinator(&self) -> &TicketCoordinator {
        &self.coordinator
    }

    pub async fn submit(&self, source: &str, config: IndexMap<String, String>) -> Result<Submission, ServiceError> {
        let definition = parse_pipeline(source).map_err(ServiceError::Invalid)?;
        let namespace = definition
            .runtime
            .namespace
            .clone()
            .filter(|namespace| !namespace.trim().is_empty())
            .unwrap_or_else(|| self.namespace.clone());

        if !definition.requires_runners() {
            let run = RunInfo::generate(&namespace, &definition.name);
            let identity = run.identity();
            let mut input = RunInput::new(run);
            input.config = config;
            info!(workflow_id = %identity.workflow_id, pipeline = %definition.name, "starting runner-less pipeline");
            self.spawn_run(definition, input);
            return Ok(Submission::Started(identity));
        }

        let mut runner_ids = Vec::with_capacity(definition.runners.len());
        for reference in &definition.runners {
            let runner_id = self
                .directory
                .resolve(reference)
                .await
                .map_err(|source| ServiceError::Directory {
                    reference: reference.clone(),
                    source,
                })?;
            runner_ids.push(runner_id);
        }

        let ticket = RunTicketRequest {
            ticket_id: Uuid::new_v4().to_string(),
            owner_namespace: namespace,
            enqueued_at: Utc::now(),
            required_runner_ids: runner_ids,
            leader_runner_id: String::new(),
            max_queue_depth: self.max_queue_depth,
            pipeline_id: definition.name.clone(),
            pipeline_source: source.to_string(),
            pipeline_config: config,
            memo: JsonMap::new(),
        };
        let ticket_id = ticket.ticket_id.clone();
        let view = self.coordinator.enqueue(ticket).await?;
        info!(ticket_id = %ticket_id, status = view.status.as_str(), position = view.position, "pipeline queued for runners");
        Ok(Submission::Queued(view))
    }

    /// Wait until every run this service started has finished, cleanup included.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = match self.runs.lock() {
                Ok(mut runs) => runs.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
            if pending.is_empty() {
                return;
            }
            for run in pending {
                let _ = run.await;
            }
        }
    }

    fn spawn_run(&self, definition: WorkflowDefinition, input: RunInput) {
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move {
            let workflow_id = input.run.workflow_id.clone();
            if let Err(error) = orchestrator.run(&definition, input).await {
                debug!(workflow_id = %workflow_id, code = error.code(), "spawned run ended with an error");
            }
        });
        let mut runs = match self.runs.lock() {
            Ok(runs) => runs,
            Err(poisoned) => poisoned.into_inner(),
        };
        runs.retain(|run| !run.is_finished());
        runs.push(handle);
    }
}

#[async_trait]
impl RunLauncher for PipelineService {
    async fn launch(&self, request: &RunTicketRequest) -> Result<RunIdentity, AdmissionError> {
        let definition = parse_pipeline(&request.pipeline_source)
            .map_err(|errors| AdmissionError::invalid(format!("ticket '{}' carries an invalid pipeline: {errors}", request.ticket_id)))?;
        let run = RunInfo {
            workflow_id: format!("{}-{}", request.pipeline_id, request.ticket_id),
            run_id: Uuid::new_v4().to_string(),
            namespace: request.owner_namespace.clone(),
            pipeline_id: request.pipeline_id.clone(),
        };
        let identity = run.identity();
        let input = RunInput {
            run,
            config: request.pipeline_config.clone(),
            payload: request
                .memo
                .get(PAYLOAD_MEMO_KEY)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            ticket: Some(request.clone()),
        };
        self.spawn_run(definition, input);
        Ok(identity)
    }
}

/// Collaborators the standard hook chains need.
pub struct StandardHooks {
    pub coordinator: TicketCoordinator,
    pub directory: Arc<dyn RunnerDirectory>,
    pub cleanup_actions: Arc<CleanupActionRegistry>,
    pub failed_cleanups: Option<Arc<dyn FailedCleanupStore>>,
    pub verification_delay: Option<Duration>,
    pub host: Option<HostClient>,
}

/// Orchestrator with the shipped hooks: runner admission on setup, then the
/// cleanup saga, runner release, and the result callback on cleanup.
pub fn standard_orchestrator(registry: TaskRegistry, runtime: ActivityRuntime, hooks: StandardHooks) -> Orchestrator {
    let mut saga = CleanupSagaHook::new(hooks.cleanup_actions);
    if let Some(store) = hooks.failed_cleanups {
        saga = saga.with_store(store);
    }
    if let Some(delay) = hooks.verification_delay {
        saga = saga.with_verification(delay);
    }

    let mut orchestrator = Orchestrator::new(registry, runtime)
        .with_setup_hook(Arc::new(RunnerAdmissionHook::new(hooks.coordinator.clone(), hooks.directory)))
        .with_cleanup_hook(Arc::new(saga))
        .with_cleanup_hook(Arc::new(RunReleaseHook::new(hooks.coordinator)));
    if let Some(host) = hooks.host {
        orchestrator = orchestrator.with_cleanup_hook(Arc::new(ResultCallbackHook::new(host)));
    }
    orchestrator
}
