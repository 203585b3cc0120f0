//! Namespace-scoped semaphore hubs and the process-wide registry of hubs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use runlane_types::{RunStatusView, RunTicketRequest, SemaphoreState};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    actor::{LauncherSlot, RunLauncher, SemaphoreHandle, SignalRouter, spawn_semaphore},
    error::AdmissionError,
    machine::{SemaphoreMachine, Signal},
    semaphore_instance_id,
    store::SemaphoreStore,
};

/// Admission RPC surface of a set of runner semaphores.
///
/// The ticket coordinator only talks to semaphores through this trait, so
/// tests can substitute a recording fake.
#[async_trait]
pub trait SemaphoreClient: Send + Sync {
    /// Start the runner's semaphore unless it is already running.
    async fn ensure_started(&self, runner_id: &str) -> Result<(), AdmissionError>;

    async fn enqueue(&self, runner_id: &str, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError>;

    async fn cancel(
        &self,
        runner_id: &str,
        ticket_id: &str,
        owner_namespace: &str,
        reason: Option<&str>,
    ) -> Result<RunStatusView, AdmissionError>;

    async fn run_done(
        &self,
        runner_id: &str,
        ticket_id: &str,
        owner_namespace: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<RunStatusView, AdmissionError>;

    async fn status(&self, runner_id: &str, owner_namespace: &str, ticket_id: &str) -> Result<RunStatusView, AdmissionError>;

    async fn list(&self, runner_id: &str) -> Result<Vec<RunStatusView>, AdmissionError>;
}

struct Instance {
    handle: SemaphoreHandle,
    task: JoinHandle<()>,
}

struct HubInner {
    namespace: String,
    capacity: usize,
    store: Arc<dyn SemaphoreStore>,
    launcher: LauncherSlot,
    instances: Mutex<HashMap<String, Instance>>,
}

impl HubInner {
    fn handle(&self, runner_id: &str) -> Option<SemaphoreHandle> {
        self.instances
            .lock()
            .ok()
            .and_then(|instances| instances.get(runner_id).map(|instance| instance.handle.clone()))
    }
}

struct HubRouter {
    hub: Weak<HubInner>,
}

impl SignalRouter for HubRouter {
    fn route(&self, runner_id: &str, signal: Signal) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        match hub.handle(runner_id) {
            Some(handle) => handle.signal(signal),
            None => warn!(namespace = %hub.namespace, runner_id, ?signal, "signal for a runner with no semaphore"),
        }
    }
}

/// All runner semaphores of one namespace.
#[derive(Clone)]
pub struct SemaphoreHub {
    inner: Arc<HubInner>,
}

impl SemaphoreHub {
    pub fn new(namespace: impl Into<String>, capacity: usize, store: Arc<dyn SemaphoreStore>, launcher: LauncherSlot) -> Self {
        Self {
            inner: Arc::new(HubInner {
                namespace: namespace.into(),
                capacity: capacity.max(1),
                store,
                launcher,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Start a runner's semaphore, restoring its last snapshot.
    pub async fn start(&self, runner_id: &str) -> Result<SemaphoreHandle, AdmissionError> {
        let runner_id = runner_id.trim();
        let instance_id = semaphore_instance_id(runner_id);
        if runner_id.is_empty() {
            return Err(AdmissionError::invalid("runner_id is required"));
        }
        if self.inner.handle(runner_id).is_some() {
            return Err(AdmissionError::AlreadyStarted { instance_id });
        }

        let mut state = self
            .inner
            .store
            .load(runner_id)
            .await?
            .unwrap_or_else(|| SemaphoreState::new(runner_id, self.inner.capacity));
        state.capacity = self.inner.capacity;

        let mut instances = self
            .inner
            .instances
            .lock()
            .map_err(|_| AdmissionError::unavailable(&instance_id, "hub lock poisoned"))?;
        if instances.contains_key(runner_id) {
            return Err(AdmissionError::AlreadyStarted { instance_id });
        }
        let router: Arc<dyn SignalRouter> = Arc::new(HubRouter {
            hub: Arc::downgrade(&self.inner),
        });
        let (handle, task) = spawn_semaphore(
            instance_id,
            SemaphoreMachine::new(state),
            self.inner.store.clone(),
            router,
            self.inner.launcher.clone(),
        );
        instances.insert(
            runner_id.to_string(),
            Instance {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    pub fn handle(&self, runner_id: &str) -> Result<SemaphoreHandle, AdmissionError> {
        let runner_id = runner_id.trim();
        self.inner
            .handle(runner_id)
            .ok_or_else(|| AdmissionError::unavailable(semaphore_instance_id(runner_id), "semaphore is not started"))
    }

    pub fn runner_ids(&self) -> Vec<String> {
        let mut runner_ids: Vec<String> = self
            .inner
            .instances
            .lock()
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        runner_ids.sort();
        runner_ids
    }

    /// Stop every semaphore and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<Instance> = match self.inner.instances.lock() {
            Ok(mut instances) => instances.drain().map(|(_, instance)| instance).collect(),
            Err(_) => Vec::new(),
        };
        for Instance { handle, task } in drained {
            let instance_id = handle.instance_id().to_string();
            handle.stop();
            if let Err(join_error) = task.await {
                warn!(instance_id = %instance_id, error = %join_error, "semaphore task ended abnormally");
            }
        }
        debug!(namespace = %self.inner.namespace, "hub shut down");
    }
}

#[async_trait]
impl SemaphoreClient for SemaphoreHub {
    async fn ensure_started(&self, runner_id: &str) -> Result<(), AdmissionError> {
        match self.start(runner_id).await {
            Ok(_) | Err(AdmissionError::AlreadyStarted { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn enqueue(&self, runner_id: &str, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError> {
        self.handle(runner_id)?.enqueue(request).await
    }

    async fn cancel(
        &self,
        runner_id: &str,
        ticket_id: &str,
        owner_namespace: &str,
        reason: Option<&str>,
    ) -> Result<RunStatusView, AdmissionError> {
        self.handle(runner_id)?.cancel(ticket_id, owner_namespace, reason).await
    }

    async fn run_done(
        &self,
        runner_id: &str,
        ticket_id: &str,
        owner_namespace: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<RunStatusView, AdmissionError> {
        self.handle(runner_id)?
            .run_done(ticket_id, owner_namespace, workflow_id, run_id)
            .await
    }

    async fn status(&self, runner_id: &str, owner_namespace: &str, ticket_id: &str) -> Result<RunStatusView, AdmissionError> {
        self.handle(runner_id)?.status(owner_namespace, ticket_id).await
    }

    async fn list(&self, runner_id: &str) -> Result<Vec<RunStatusView>, AdmissionError> {
        self.handle(runner_id)?.list().await
    }
}

/// Builds the store for a namespace's hub.
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn SemaphoreStore> + Send + Sync>;

/// Process-owned, namespace-keyed registry of hubs.
///
/// Hubs are built lazily on first use and share one launcher slot.
pub struct HubRegistry {
    capacity: usize,
    store_factory: StoreFactory,
    launcher: LauncherSlot,
    hubs: Mutex<HashMap<String, SemaphoreHub>>,
}

impl HubRegistry {
    pub fn new(capacity: usize, store_factory: StoreFactory) -> Self {
        Self {
            capacity,
            store_factory,
            launcher: LauncherSlot::default(),
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the launcher leader semaphores use to start runs.
    ///
    /// Only a weak reference is kept; the caller owns the launcher.
    pub fn bind_launcher(&self, launcher: &Arc<dyn RunLauncher>) {
        self.launcher.bind(launcher);
    }

    /// Hub for `namespace`, creating it on first use.
    pub fn hub(&self, namespace: &str) -> SemaphoreHub {
        let namespace = namespace.trim();
        let mut hubs = match self.hubs.lock() {
            Ok(hubs) => hubs,
            Err(poisoned) => poisoned.into_inner(),
        };
        hubs.entry(namespace.to_string())
            .or_insert_with(|| {
                info!(namespace, "creating semaphore hub");
                SemaphoreHub::new(
                    namespace,
                    self.capacity,
                    (self.store_factory)(namespace),
                    self.launcher.clone(),
                )
            })
            .clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .hubs
            .lock()
            .map(|hubs| hubs.keys().cloned().collect())
            .unwrap_or_default();
        namespaces.sort();
        namespaces
    }

    /// Forget every hub. Semaphores stop once outstanding handles are dropped.
    pub fn clear(&self) {
        if let Ok(mut hubs) = self.hubs.lock() {
            hubs.clear();
        }
    }

    /// Shut down every hub and forget them.
    pub async fn shutdown(&self) {
        let hubs: Vec<SemaphoreHub> = match self.hubs.lock() {
            Ok(mut hubs) => hubs.drain().map(|(_, hub)| hub).collect(),
            Err(_) => Vec::new(),
        };
        for hub in hubs {
            hub.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySemaphoreStore;

    fn registry() -> HubRegistry {
        HubRegistry::new(1, Arc::new(|_: &str| Arc::new(MemorySemaphoreStore::new()) as Arc<dyn SemaphoreStore>))
    }

    #[tokio::test]
    async fn start_twice_reports_already_started() {
        let hub = registry().hub("acme");
        hub.start("r1").await.expect("first start");
        let error = hub.start(" r1 ").await.expect_err("second start");
        assert_eq!(
            error,
            AdmissionError::AlreadyStarted {
                instance_id: "runner-semaphore/r1".into()
            }
        );
        hub.ensure_started("r1").await.expect("idempotent");
        assert_eq!(hub.runner_ids(), vec!["r1"]);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn calls_to_unstarted_runner_are_unavailable() {
        let hub = registry().hub("acme");
        let error = hub.list("ghost").await.expect_err("not started");
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn registry_reuses_hubs_per_namespace() {
        let registry = registry();
        registry.hub("acme").start("r1").await.expect("start");
        assert!(registry.hub("acme").handle("r1").is_ok());
        assert!(registry.hub("other").handle("r1").is_err());
        assert_eq!(registry.namespaces(), vec!["acme", "other"]);

        registry.shutdown().await;
        assert!(registry.namespaces().is_empty());
    }
}
