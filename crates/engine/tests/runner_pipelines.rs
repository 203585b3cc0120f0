use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use runlane_admission::{AdmissionError, HubRegistry, MemorySemaphoreStore, RunLauncher, SemaphoreClient, SemaphoreStore, TicketCoordinator};
use runlane_cleanup::{CleanupAction, CleanupActionRegistry, CleanupError};
use runlane_engine::{
    Activity, ActivityError, ActivityInput, ActivityRuntime, OutputKind, PipelineService, ServiceError, StandardHooks,
    StaticRunnerDirectory, Submission, TaskEntry, builtin_tasks, standard_orchestrator,
};
use runlane_types::{CleanupStepSpec, RunStatus, RunStatusView};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Stands in for a device session: records the runner it was given and
/// registers a stop step for it.
struct DeviceCheck {
    seen: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Activity for DeviceCheck {
    fn name(&self) -> &str {
        "mobile/check-device"
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        let runner_id = input.text("runner_id").unwrap_or_default();
        self.seen.lock().unwrap().push(runner_id.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(json!({ "runner_id": runner_id }))
    }

    fn compensation(&self, input: &ActivityInput, _output: &Value) -> Vec<CleanupStepSpec> {
        let runner_id = input.text("runner_id").unwrap_or_default();
        vec![CleanupStepSpec::new(format!("stop {runner_id}"), "stop-emulator", json!({ "runner_id": runner_id }))]
    }
}

#[derive(Default)]
struct RecordingCleanup {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CleanupAction for RecordingCleanup {
    async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
        self.calls.lock().unwrap().push(step.name.clone());
        Ok(())
    }
}

struct Harness {
    _hubs: HubRegistry,
    service: Arc<PipelineService>,
    coordinator: TicketCoordinator,
    seen: Arc<Mutex<Vec<String>>>,
    cleanup: Arc<RecordingCleanup>,
}

fn harness(gate: Option<Arc<Notify>>, max_queue_depth: usize) -> Harness {
    let store: Arc<dyn SemaphoreStore> = Arc::new(MemorySemaphoreStore::new());
    let hubs = HubRegistry::new(1, Arc::new(move |_: &str| store.clone()));
    let client: Arc<dyn SemaphoreClient> = Arc::new(hubs.hub("acme"));
    let coordinator = TicketCoordinator::new(client);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = builtin_tasks()
        .expect("builtins")
        .register(TaskEntry::activity(
            "mobile/check-device",
            Arc::new(DeviceCheck {
                seen: seen.clone(),
                gate,
            }),
            OutputKind::Map,
        ))
        .build();

    let cleanup = Arc::new(RecordingCleanup::default());
    let directory = Arc::new(StaticRunnerDirectory::new().with_alias("acme/pixel-8", "r1"));
    let orchestrator = standard_orchestrator(
        registry,
        ActivityRuntime::default(),
        StandardHooks {
            coordinator: coordinator.clone(),
            directory: directory.clone(),
            cleanup_actions: Arc::new(CleanupActionRegistry::new().register("stop-emulator", cleanup.clone())),
            failed_cleanups: None,
            verification_delay: None,
            host: None,
        },
    );

    let service = Arc::new(
        PipelineService::new(orchestrator, coordinator.clone(), directory)
            .with_namespace("acme")
            .with_max_queue_depth(max_queue_depth),
    );
    let launcher: Arc<dyn RunLauncher> = service.clone();
    hubs.bind_launcher(&launcher);

    Harness {
        _hubs: hubs,
        service,
        coordinator,
        seen,
        cleanup,
    }
}

const DEVICE_PIPELINE: &str = r#"
name: device-smoke
runners: [acme/pixel-8, r2]
steps:
  - id: session
    use: mobile/check-device
  - id: summary
    use: core/echo
    with:
      payload:
        ran_on: "${{ session.outputs.runner_id }}"
"#;

async fn wait_until_released(coordinator: &TicketCoordinator, view: &RunStatusView) {
    for _ in 0..400 {
        let current = coordinator
            .status(&view.ticket_id, "acme", &view.required_runner_ids)
            .await
            .expect("status");
        if matches!(current.status, RunStatus::Done | RunStatus::NotFound) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("ticket {} was never released", view.ticket_id);
}

#[tokio::test]
async fn runner_pipeline_is_admitted_run_and_released() {
    let harness = harness(None, 0);
    let submission = harness
        .service
        .submit(DEVICE_PIPELINE, IndexMap::new())
        .await
        .expect("submit");
    let Submission::Queued(view) = submission else {
        panic!("expected a queued submission, got {submission:?}");
    };
    assert_eq!(view.required_runner_ids, vec!["r1".to_string(), "r2".to_string()]);

    wait_until_released(&harness.coordinator, &view).await;
    harness.service.wait_idle().await;

    assert_eq!(*harness.seen.lock().unwrap(), vec!["r1".to_string()]);
    assert_eq!(*harness.cleanup.calls.lock().unwrap(), vec!["stop r1".to_string()]);
}

#[tokio::test]
async fn runner_less_pipeline_starts_immediately() {
    let harness = harness(None, 0);
    let submission = harness
        .service
        .submit("name: quick\nsteps:\n  - id: a\n    use: core/echo\n", IndexMap::new())
        .await
        .expect("submit");
    let Submission::Started(identity) = submission else {
        panic!("expected a started run, got {submission:?}");
    };
    assert!(identity.workflow_id.starts_with("quick-"));
    assert_eq!(identity.namespace, "acme");
    harness.service.wait_idle().await;
    assert!(harness.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn full_queue_rejects_with_queue_limit() {
    let gate = Arc::new(Notify::new());
    let harness = harness(Some(gate.clone()), 1);

    let first = harness
        .service
        .submit(DEVICE_PIPELINE, IndexMap::new())
        .await
        .expect("first submit");
    let error = harness
        .service
        .submit(DEVICE_PIPELINE, IndexMap::new())
        .await
        .expect_err("queue is full");
    assert!(
        matches!(error, ServiceError::Admission(AdmissionError::QueueLimitExceeded { limit: 1, .. })),
        "{error}"
    );
    assert_eq!(error.code(), "QUEUE_LIMIT_EXCEEDED");

    gate.notify_one();
    if let Submission::Queued(view) = first {
        wait_until_released(&harness.coordinator, &view).await;
    }
    harness.service.wait_idle().await;
}

#[tokio::test]
async fn invalid_pipeline_is_rejected_before_admission() {
    let harness = harness(None, 0);
    let error = harness
        .service
        .submit("name: ''\nsteps: []\n", IndexMap::new())
        .await
        .expect_err("invalid");
    assert_eq!(error.code(), "INVALID_PIPELINE");
}
