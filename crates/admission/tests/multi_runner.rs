use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use runlane_admission::{
    AdmissionError, FileSemaphoreStore, HubRegistry, MemorySemaphoreStore, RunLauncher, SemaphoreClient, SemaphoreStore,
    TicketCoordinator,
};
use runlane_types::{RunIdentity, RunStatus, RunStatusView, RunTicketRequest};

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunLauncher for RecordingLauncher {
    async fn launch(&self, request: &RunTicketRequest) -> Result<RunIdentity, AdmissionError> {
        self.launched.lock().unwrap().push(request.ticket_id.clone());
        Ok(RunIdentity {
            workflow_id: format!("wf-{}", request.ticket_id),
            run_id: "run-1".into(),
            namespace: request.owner_namespace.clone(),
        })
    }
}

fn ticket(ticket_id: &str, runners: &[&str], second: u32) -> RunTicketRequest {
    RunTicketRequest {
        ticket_id: ticket_id.into(),
        owner_namespace: "acme".into(),
        enqueued_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, second).unwrap(),
        required_runner_ids: runners.iter().map(|runner| runner.to_string()).collect(),
        leader_runner_id: String::new(),
        max_queue_depth: 0,
        pipeline_id: "pipe".into(),
        pipeline_source: "name: pipe".into(),
        pipeline_config: Default::default(),
        memo: Default::default(),
    }
}

fn memory_registry() -> HubRegistry {
    let store: Arc<dyn SemaphoreStore> = Arc::new(MemorySemaphoreStore::new());
    HubRegistry::new(1, Arc::new(move |_: &str| store.clone()))
}

async fn wait_for_status(
    coordinator: &TicketCoordinator,
    ticket_id: &str,
    runners: &[String],
    expected: RunStatus,
) -> RunStatusView {
    for _ in 0..200 {
        let view = coordinator.status(ticket_id, "acme", runners).await.expect("status");
        if view.status == expected {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("ticket {ticket_id} never reached {expected:?}");
}

#[tokio::test]
async fn leader_launches_once_every_runner_granted() {
    let registry = memory_registry();
    let launcher = Arc::new(RecordingLauncher::default());
    let bound: Arc<dyn RunLauncher> = launcher.clone();
    registry.bind_launcher(&bound);

    let hub = registry.hub("acme");
    let coordinator = TicketCoordinator::new(Arc::new(hub.clone()));
    let runners = vec!["r1".to_string(), "r2".to_string()];

    coordinator.enqueue(ticket("t1", &["r2", "r1"], 0)).await.expect("enqueue");
    let view = wait_for_status(&coordinator, "t1", &runners, RunStatus::Running).await;
    assert_eq!(view.workflow_id.as_deref(), Some("wf-t1"));
    assert_eq!(view.granted_runner_ids, runners);
    assert_eq!(launcher.launched(), vec!["t1"]);

    // A second ticket waits on both runners until the first is released.
    let queued = coordinator.enqueue(ticket("t2", &["r1", "r2"], 1)).await.expect("enqueue t2");
    assert_eq!(queued.status, RunStatus::Queued);
    assert_eq!(queued.position, 2);

    let released = coordinator
        .release("t1", "acme", &runners, "wf-t1", "run-1")
        .await
        .expect("release");
    assert_eq!(released.status, RunStatus::Done);
    wait_for_status(&coordinator, "t2", &runners, RunStatus::Running).await;
    assert_eq!(launcher.launched(), vec!["t1", "t2"]);

    // Releasing again is an idempotent no-op.
    let again = coordinator
        .release("t1", "acme", &runners, "wf-t1", "run-1")
        .await
        .expect("second release");
    assert!(again.is_not_found());

    registry.shutdown().await;
}

#[tokio::test]
async fn queue_limit_rolls_back_earlier_runners() {
    let registry = memory_registry();
    let launcher: Arc<dyn RunLauncher> = Arc::new(RecordingLauncher::default());
    registry.bind_launcher(&launcher);
    let hub = registry.hub("acme");
    let coordinator = TicketCoordinator::new(Arc::new(hub.clone()));

    // r2 is busy with a single-runner ticket, r1 is idle.
    coordinator.enqueue(ticket("busy", &["r2"], 0)).await.expect("busy");

    let mut limited = ticket("t1", &["r1", "r2"], 1);
    limited.max_queue_depth = 1;
    let error = coordinator.enqueue(limited).await.expect_err("r2 is full");
    assert!(matches!(error, AdmissionError::QueueLimitExceeded { ref runner_id, .. } if runner_id == "r2"));

    let on_r1 = hub.status("r1", "acme", "t1").await.expect("status");
    assert!(on_r1.is_not_found(), "r1 kept the ticket: {on_r1:?}");
    assert!(hub.list("r1").await.expect("list").is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn cancel_twice_is_not_an_error() {
    let registry = memory_registry();
    let launcher: Arc<dyn RunLauncher> = Arc::new(RecordingLauncher::default());
    registry.bind_launcher(&launcher);
    let hub = registry.hub("acme");
    let coordinator = TicketCoordinator::new(Arc::new(hub.clone()));
    let runners = vec!["r1".to_string()];

    let running = coordinator.enqueue(ticket("t1", &["r1"], 0)).await.expect("enqueue");
    assert_eq!(running.status, RunStatus::Running);
    let queued = coordinator.enqueue(ticket("t2", &["r1"], 1)).await.expect("enqueue t2");
    assert_eq!((queued.status, queued.position, queued.line_len), (RunStatus::Queued, 2, 2));

    let first = coordinator.cancel("t2", "acme", &runners, Some("user")).await.expect("cancel");
    assert_eq!(first.status, RunStatus::Canceled);
    let second = coordinator.cancel("t2", "acme", &runners, Some("user")).await.expect("cancel again");
    assert!(second.is_not_found());

    registry.shutdown().await;
}

#[tokio::test]
async fn canceled_running_ticket_holds_the_device_until_released() {
    let registry = memory_registry();
    let recorder = Arc::new(RecordingLauncher::default());
    let launcher: Arc<dyn RunLauncher> = recorder.clone();
    registry.bind_launcher(&launcher);
    let coordinator = TicketCoordinator::new(Arc::new(registry.hub("acme")));
    let runners = vec!["r1".to_string()];

    coordinator.enqueue(ticket("t1", &["r1"], 0)).await.expect("enqueue t1");
    wait_for_status(&coordinator, "t1", &runners, RunStatus::Running).await;
    coordinator.enqueue(ticket("t2", &["r1"], 1)).await.expect("enqueue t2");

    let canceled = coordinator.cancel("t1", "acme", &runners, Some("user")).await.expect("cancel");
    assert_eq!(canceled.status, RunStatus::Canceled);
    let waiting = coordinator.status("t2", "acme", &runners).await.expect("status t2");
    assert_eq!(waiting.status, RunStatus::Queued);
    assert_eq!(recorder.launched(), vec!["t1".to_string()]);

    coordinator
        .release("t1", "acme", &runners, "wf-t1", "run-1")
        .await
        .expect("release");
    wait_for_status(&coordinator, "t2", &runners, RunStatus::Running).await;
    assert_eq!(recorder.launched(), vec!["t1".to_string(), "t2".to_string()]);

    registry.shutdown().await;
}

#[tokio::test]
async fn launch_without_launcher_fails_the_ticket() {
    let registry = memory_registry();
    let hub = registry.hub("acme");
    let coordinator = TicketCoordinator::new(Arc::new(hub.clone()));

    coordinator.enqueue(ticket("t1", &["r1"], 0)).await.expect("enqueue");
    assert!(hub.status("r1", "acme", "t1").await.expect("status").is_not_found());
    assert!(hub.list("r1").await.expect("list").is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn file_snapshots_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let factory = move |namespace: &str| Arc::new(FileSemaphoreStore::new(root.join(namespace))) as Arc<dyn SemaphoreStore>;

    let launcher = Arc::new(RecordingLauncher::default());
    let bound: Arc<dyn RunLauncher> = launcher.clone();

    let first = HubRegistry::new(1, Arc::new(factory.clone()));
    first.bind_launcher(&bound);
    let coordinator = TicketCoordinator::new(Arc::new(first.hub("acme")));
    coordinator.enqueue(ticket("t1", &["r1"], 0)).await.expect("t1");
    coordinator.enqueue(ticket("t2", &["r1"], 1)).await.expect("t2");
    first.shutdown().await;

    let second = HubRegistry::new(1, Arc::new(factory));
    second.bind_launcher(&bound);
    let hub = second.hub("acme");
    hub.ensure_started("r1").await.expect("restart");
    let queued: Vec<(String, RunStatus)> = hub
        .list("r1")
        .await
        .expect("list")
        .into_iter()
        .map(|view| (view.ticket_id, view.status))
        .collect();
    assert_eq!(
        queued,
        vec![("t1".to_string(), RunStatus::Running), ("t2".to_string(), RunStatus::Queued)]
    );
    assert_eq!(launcher.launched(), vec!["t1"]);
    second.shutdown().await;
}
