//! The task that owns one runner's [`SemaphoreMachine`].
//!
//! Updates and queries arrive over an unbounded channel and are handled
//! strictly one at a time. Every mutation is saved to the store before its
//! effects run or its reply is sent.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock, Weak},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runlane_types::{RunIdentity, RunStatusView, RunTicketRequest};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::AdmissionError,
    machine::{Effect, SemaphoreMachine, Signal},
    store::SemaphoreStore,
};

/// Starts the pipeline run for a fully granted ticket.
///
/// Called from inside the leader's semaphore task, so implementations must
/// only spawn the run and return its identity; waiting for the run to finish
/// would stall the runner's queue.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, request: &RunTicketRequest) -> Result<RunIdentity, AdmissionError>;
}

/// Late-bound launcher shared by every semaphore of a registry.
///
/// Holds a weak reference so the launcher (which usually owns a coordinator
/// that owns the registry) is not kept alive by its own semaphores.
#[derive(Clone, Default)]
pub struct LauncherSlot {
    inner: Arc<RwLock<Option<Weak<dyn RunLauncher>>>>,
}

impl LauncherSlot {
    pub fn bind(&self, launcher: &Arc<dyn RunLauncher>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(Arc::downgrade(launcher));
        }
    }

    pub fn get(&self) -> Option<Arc<dyn RunLauncher>> {
        self.inner
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }
}

/// Delivers signals to other semaphore instances.
pub trait SignalRouter: Send + Sync {
    fn route(&self, runner_id: &str, signal: Signal);
}

type Reply<T> = oneshot::Sender<Result<T, AdmissionError>>;

enum Command {
    Enqueue {
        request: RunTicketRequest,
        reply: Reply<RunStatusView>,
    },
    Cancel {
        ticket_id: String,
        owner_namespace: String,
        reason: Option<String>,
        reply: Reply<RunStatusView>,
    },
    RunDone {
        ticket_id: String,
        owner_namespace: String,
        workflow_id: String,
        run_id: String,
        reply: Reply<RunStatusView>,
    },
    Status {
        owner_namespace: String,
        ticket_id: String,
        reply: Reply<RunStatusView>,
    },
    List {
        reply: Reply<Vec<RunStatusView>>,
    },
    Signal(Signal),
    Stop,
}

/// Cheap, cloneable address of a running semaphore.
#[derive(Clone)]
pub struct SemaphoreHandle {
    instance_id: String,
    runner_id: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for SemaphoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreHandle")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl SemaphoreHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub async fn enqueue(&self, request: RunTicketRequest) -> Result<RunStatusView, AdmissionError> {
        self.call(|reply| Command::Enqueue { request, reply }).await
    }

    pub async fn cancel(&self, ticket_id: &str, owner_namespace: &str, reason: Option<&str>) -> Result<RunStatusView, AdmissionError> {
        self.call(|reply| Command::Cancel {
            ticket_id: ticket_id.to_string(),
            owner_namespace: owner_namespace.to_string(),
            reason: reason.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn run_done(
        &self,
        ticket_id: &str,
        owner_namespace: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<RunStatusView, AdmissionError> {
        self.call(|reply| Command::RunDone {
            ticket_id: ticket_id.to_string(),
            owner_namespace: owner_namespace.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn status(&self, owner_namespace: &str, ticket_id: &str) -> Result<RunStatusView, AdmissionError> {
        self.call(|reply| Command::Status {
            owner_namespace: owner_namespace.to_string(),
            ticket_id: ticket_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<RunStatusView>, AdmissionError> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Fire-and-forget delivery; a stopped instance only logs.
    pub fn signal(&self, signal: Signal) {
        if self.commands.send(Command::Signal(signal)).is_err() {
            warn!(instance_id = %self.instance_id, "dropping signal for stopped semaphore");
        }
    }

    /// Ask the task to exit after the commands already queued.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, AdmissionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| AdmissionError::unavailable(&self.instance_id, "semaphore is stopped"))?;
        response
            .await
            .map_err(|_| AdmissionError::unavailable(&self.instance_id, "semaphore stopped before replying"))?
    }
}

/// Spawn the task for one runner. The task exits on [`SemaphoreHandle::stop`]
/// or once every handle is dropped.
pub(crate) fn spawn_semaphore(
    instance_id: String,
    machine: SemaphoreMachine,
    store: Arc<dyn SemaphoreStore>,
    router: Arc<dyn SignalRouter>,
    launcher: LauncherSlot,
) -> (SemaphoreHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let handle = SemaphoreHandle {
        instance_id: instance_id.clone(),
        runner_id: machine.runner_id().to_string(),
        commands,
    };
    let actor = SemaphoreActor {
        instance_id,
        machine,
        store,
        router,
        launcher,
    };
    let task = tokio::spawn(actor.run(receiver));
    (handle, task)
}

struct SemaphoreActor {
    instance_id: String,
    machine: SemaphoreMachine,
    store: Arc<dyn SemaphoreStore>,
    router: Arc<dyn SignalRouter>,
    launcher: LauncherSlot,
}

impl SemaphoreActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(instance_id = %self.instance_id, line_len = self.machine.state().queue.len(), "semaphore started");
        // Grants and leader launches are re-derived from the restored snapshot.
        let effects = self.machine.admit();
        self.persist().await;
        self.apply(effects).await;

        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Stop) {
                break;
            }
            self.handle(command).await;
        }
        debug!(instance_id = %self.instance_id, "semaphore stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, reply } => {
                let result = self.mutate(|machine, _| machine.enqueue(request)).await;
                let _ = reply.send(result);
            }
            Command::Cancel {
                ticket_id,
                owner_namespace,
                reason,
                reply,
            } => {
                let result = self
                    .mutate(|machine, now| Ok(machine.cancel(&ticket_id, &owner_namespace, reason.as_deref(), now)))
                    .await;
                let _ = reply.send(result);
            }
            Command::RunDone {
                ticket_id,
                owner_namespace,
                workflow_id,
                run_id,
                reply,
            } => {
                let result = self
                    .mutate(|machine, now| Ok(machine.run_done(&ticket_id, &owner_namespace, &workflow_id, &run_id, now)))
                    .await;
                let _ = reply.send(result);
            }
            Command::Status {
                owner_namespace,
                ticket_id,
                reply,
            } => {
                let _ = reply.send(Ok(self.machine.status(&owner_namespace, &ticket_id)));
            }
            Command::List { reply } => {
                let _ = reply.send(Ok(self.machine.list()));
            }
            Command::Signal(signal) => {
                let effects = self.machine.signal(signal, Utc::now());
                self.persist().await;
                self.apply(effects).await;
            }
            Command::Stop => {}
        }
    }

    /// Apply one update, save it, then run its effects.
    ///
    /// A failed save rolls the in-memory state back so the caller's error and
    /// the durable state agree.
    async fn mutate<F>(&mut self, update: F) -> Result<RunStatusView, AdmissionError>
    where
        F: FnOnce(&mut SemaphoreMachine, DateTime<Utc>) -> Result<(RunStatusView, Vec<Effect>), AdmissionError>,
    {
        let snapshot = self.machine.clone();
        let (view, effects) = update(&mut self.machine, Utc::now())?;
        if let Err(error) = self.store.save(self.machine.state()).await {
            self.machine = snapshot;
            return Err(error);
        }
        self.apply(effects).await;

        if view.status.is_terminal() || view.is_not_found() {
            return Ok(view);
        }
        Ok(self.machine.view(&view.ticket_id).unwrap_or(view))
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut pending: VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Send { runner_id, signal } => self.router.route(&runner_id, signal),
                Effect::Launch { request } => {
                    let follow_up = self.launch(&request).await;
                    self.persist().await;
                    pending.extend(follow_up);
                }
            }
        }
    }

    async fn launch(&mut self, request: &RunTicketRequest) -> Vec<Effect> {
        let ticket_id = request.ticket_id.as_str();
        let Some(launcher) = self.launcher.get() else {
            warn!(ticket_id, instance_id = %self.instance_id, "no run launcher bound");
            return self
                .machine
                .launch_failed(ticket_id, "no run launcher is available".into(), Utc::now());
        };

        match launcher.launch(request).await {
            Ok(run) => {
                info!(
                    ticket_id,
                    workflow_id = %run.workflow_id,
                    run_id = %run.run_id,
                    "run launched for ticket"
                );
                self.machine.launched(ticket_id, run, Utc::now())
            }
            Err(launch_error) => {
                warn!(ticket_id, error = %launch_error, "run launch failed");
                self.machine
                    .launch_failed(ticket_id, launch_error.to_string(), Utc::now())
            }
        }
    }

    async fn persist(&self) {
        if let Err(save_error) = self.store.save(self.machine.state()).await {
            error!(instance_id = %self.instance_id, error = %save_error, "failed to persist semaphore state");
        }
    }
}
