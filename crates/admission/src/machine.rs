//! The per-runner admission state machine.
//!
//! [`SemaphoreMachine`] is pure: every entry point mutates the wrapped
//! [`SemaphoreState`] and returns the [`Effect`]s the owning actor must carry
//! out (signals to other runners, launching a run). Keeping I/O out of here
//! lets the actor persist the state before any effect becomes visible.
//!
//! Queue layout: running tickets first (in the order they started, including
//! running tickets that were canceled but have not reported done), then every
//! other active ticket ordered by `(enqueued_at, ticket_id)`. The first
//! `capacity` entries hold a grant. Because every runner applies the same
//! order to the same replicated requests, two multi-runner tickets can never
//! hold grants on each other's runners indefinitely: a later ticket holding a
//! grant that an earlier ticket needs is demoted back to `queued`.

use chrono::{DateTime, Utc};
use runlane_types::{PendingGrant, RunIdentity, RunStatus, RunStatusView, RunTicketRequest, RunTicketState, SemaphoreState};
use tracing::{debug, info};

use crate::error::AdmissionError;

/// Early grants older than this are dropped; their ticket never reached the leader.
pub const PENDING_GRANT_TTL_SECS: i64 = 15 * 60;

/// Fire-and-forget messages exchanged between semaphore instances.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Follower -> leader: `runner_id` granted the ticket a slot.
    GrantObserved { ticket_id: String, runner_id: String },
    /// Follower -> leader: `runner_id` took its grant back before the run started.
    GrantRevoked { ticket_id: String, runner_id: String },
    /// Leader -> followers: the pipeline run started.
    RunStarted {
        ticket_id: String,
        run: RunIdentity,
        started_at: DateTime<Utc>,
    },
    /// Leader -> followers: the run could not be started.
    RunFailed { ticket_id: String, error: String },
}

/// Work the owning actor performs after persisting the new state.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { runner_id: String, signal: Signal },
    Launch { request: RunTicketRequest },
}

#[derive(Debug, Clone)]
pub struct SemaphoreMachine {
    state: SemaphoreState,
}

impl SemaphoreMachine {
    pub fn new(state: SemaphoreState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &SemaphoreState {
        &self.state
    }

    pub fn runner_id(&self) -> &str {
        &self.state.runner_id
    }

    /// Admit a ticket onto this runner.
    ///
    /// Re-enqueueing a ticket that is still active returns its current view
    /// without changing anything.
    pub fn enqueue(&mut self, mut request: RunTicketRequest) -> Result<(RunStatusView, Vec<Effect>), AdmissionError> {
        request.ticket_id = request.ticket_id.trim().to_string();
        request.owner_namespace = request.owner_namespace.trim().to_string();
        if request.ticket_id.is_empty() {
            return Err(AdmissionError::invalid("ticket_id is required"));
        }
        if request.owner_namespace.is_empty() {
            return Err(AdmissionError::invalid("owner_namespace is required"));
        }

        let runner_id = self.state.runner_id.clone();
        if request.required_runner_ids.is_empty() {
            request.required_runner_ids = vec![runner_id.clone()];
        }
        if !request.required_runner_ids.contains(&runner_id) {
            return Err(AdmissionError::invalid(format!(
                "runner '{runner_id}' is not one of the ticket's required runners"
            )));
        }
        if request.leader_runner_id.trim().is_empty() {
            request.leader_runner_id = request.required_runner_ids[0].clone();
        } else if !request.required_runner_ids.contains(&request.leader_runner_id) {
            return Err(AdmissionError::invalid(format!(
                "leader '{}' is not one of the ticket's required runners",
                request.leader_runner_id
            )));
        }

        if let Some(existing) = self.state.tickets.get(&request.ticket_id) {
            if existing.request.owner_namespace != request.owner_namespace {
                return Err(AdmissionError::invalid(format!(
                    "ticket '{}' belongs to another namespace",
                    request.ticket_id
                )));
            }
            debug!(ticket_id = %request.ticket_id, runner_id = %runner_id, "ticket already enqueued");
            return Ok((self.view_of(existing), Vec::new()));
        }

        let limit = request.max_queue_depth;
        if limit > 0 && self.state.queue.len() >= limit {
            return Err(AdmissionError::QueueLimitExceeded {
                runner_id,
                line_len: self.state.queue.len(),
                limit,
            });
        }

        let ticket_id = request.ticket_id.clone();
        let mut ticket = RunTicketState::new(request);
        if let Some(early) = self.state.pending_grants.remove(&ticket_id) {
            ticket.granted_runner_ids.extend(early.runner_ids);
        }
        self.state.tickets.insert(ticket_id.clone(), ticket);
        self.state.queue.push(ticket_id.clone());
        info!(ticket_id = %ticket_id, runner_id = %runner_id, line_len = self.state.queue.len(), "ticket enqueued");

        let effects = self.admit();
        let view = self
            .view(&ticket_id)
            .unwrap_or_else(|| RunStatusView::not_found(ticket_id, ""));
        Ok((view, effects))
    }

    /// Cancel a ticket. Unknown tickets answer `not_found`.
    ///
    /// A waiting ticket leaves the queue at once. A running ticket is only
    /// marked canceled: its run still occupies the device, so the slot stays
    /// taken until [`SemaphoreMachine::run_done`] releases it.
    pub fn cancel(
        &mut self,
        ticket_id: &str,
        owner_namespace: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> (RunStatusView, Vec<Effect>) {
        if !self.owns(ticket_id, owner_namespace) {
            return (self.not_found(ticket_id, owner_namespace), Vec::new());
        }
        let error = reason
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(|reason| format!("canceled: {reason}"));

        if let Some(ticket) = self.state.tickets.get_mut(ticket_id)
            && matches!(ticket.status, RunStatus::Running | RunStatus::Canceled)
        {
            if ticket.status == RunStatus::Running {
                ticket.status = RunStatus::Canceled;
                ticket.error = error.or_else(|| Some("canceled".into()));
                info!(ticket_id, runner_id = %self.state.runner_id, "running ticket canceled; slot held until the run reports done");
            }
            let view = self.view(ticket_id).unwrap_or_else(|| self.not_found(ticket_id, owner_namespace));
            return (view, Vec::new());
        }

        let Some((view, previous, request)) = self.finish(ticket_id, RunStatus::Canceled, error, now) else {
            return (self.not_found(ticket_id, owner_namespace), Vec::new());
        };
        info!(ticket_id, runner_id = %self.state.runner_id, "ticket canceled");

        let mut effects = Vec::new();
        if request.leader_runner_id == self.state.runner_id {
            let error = view.error.clone().unwrap_or_else(|| "canceled".into());
            effects.extend(
                request
                    .required_runner_ids
                    .iter()
                    .filter(|runner| **runner != self.state.runner_id)
                    .map(|runner| Effect::Send {
                        runner_id: runner.clone(),
                        signal: Signal::RunFailed {
                            ticket_id: ticket_id.to_string(),
                            error: error.clone(),
                        },
                    }),
            );
        } else if previous == RunStatus::Starting {
            effects.push(Effect::Send {
                runner_id: request.leader_runner_id.clone(),
                signal: Signal::GrantRevoked {
                    ticket_id: ticket_id.to_string(),
                    runner_id: self.state.runner_id.clone(),
                },
            });
        }
        effects.extend(self.admit());
        (view, effects)
    }

    /// Mark a ticket done and release its slot.
    ///
    /// A ticket canceled while running keeps its canceled status.
    pub fn run_done(
        &mut self,
        ticket_id: &str,
        owner_namespace: &str,
        workflow_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> (RunStatusView, Vec<Effect>) {
        if !self.owns(ticket_id, owner_namespace) {
            return (self.not_found(ticket_id, owner_namespace), Vec::new());
        }
        if let Some(ticket) = self.state.tickets.get_mut(ticket_id)
            && ticket.run.is_none()
            && !workflow_id.trim().is_empty()
        {
            ticket.run = Some(RunIdentity {
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
                namespace: owner_namespace.trim().to_string(),
            });
        }
        let status = match self.state.tickets.get(ticket_id).map(|ticket| ticket.status) {
            Some(RunStatus::Canceled) => RunStatus::Canceled,
            _ => RunStatus::Done,
        };
        let Some((view, _, _)) = self.finish(ticket_id, status, None, now) else {
            return (self.not_found(ticket_id, owner_namespace), Vec::new());
        };
        info!(ticket_id, runner_id = %self.state.runner_id, workflow_id, "ticket done");
        (view, self.admit())
    }

    /// Read-only status for a ticket owned by `owner_namespace`.
    pub fn status(&self, owner_namespace: &str, ticket_id: &str) -> RunStatusView {
        if !self.owns(ticket_id, owner_namespace) {
            return self.not_found(ticket_id, owner_namespace);
        }
        self.view(ticket_id)
            .unwrap_or_else(|| self.not_found(ticket_id, owner_namespace))
    }

    /// Views of every active ticket in queue order.
    pub fn list(&self) -> Vec<RunStatusView> {
        self.state
            .queue
            .iter()
            .filter_map(|ticket_id| self.view(ticket_id))
            .collect()
    }

    /// Apply a signal from another runner's instance.
    pub fn signal(&mut self, signal: Signal, now: DateTime<Utc>) -> Vec<Effect> {
        self.prune_pending_grants(now);
        match signal {
            Signal::GrantObserved { ticket_id, runner_id } => {
                match self.state.tickets.get_mut(&ticket_id) {
                    Some(ticket) if !ticket.status.is_terminal() => {
                        ticket.granted_runner_ids.insert(runner_id);
                    }
                    Some(_) => {}
                    None => {
                        debug!(ticket_id = %ticket_id, runner_id = %runner_id, "grant observed before enqueue");
                        self.state
                            .pending_grants
                            .entry(ticket_id)
                            .or_insert_with(|| PendingGrant {
                                runner_ids: Default::default(),
                                observed_at: now,
                            })
                            .runner_ids
                            .insert(runner_id);
                    }
                }
                self.ready_launches()
            }
            Signal::GrantRevoked { ticket_id, runner_id } => {
                if let Some(ticket) = self.state.tickets.get_mut(&ticket_id)
                    && ticket.status != RunStatus::Running
                {
                    ticket.granted_runner_ids.remove(&runner_id);
                }
                if let Some(early) = self.state.pending_grants.get_mut(&ticket_id) {
                    early.runner_ids.remove(&runner_id);
                    if early.runner_ids.is_empty() {
                        self.state.pending_grants.remove(&ticket_id);
                    }
                }
                Vec::new()
            }
            Signal::RunStarted {
                ticket_id,
                run,
                started_at,
            } => {
                if let Some(ticket) = self.state.tickets.get_mut(&ticket_id)
                    && !ticket.status.is_terminal()
                {
                    ticket.status = RunStatus::Running;
                    ticket.started_at = Some(started_at);
                    ticket.granted_runner_ids = ticket.request.required_runner_ids.iter().cloned().collect();
                    ticket.run = Some(run);
                }
                self.admit()
            }
            Signal::RunFailed { ticket_id, error } => {
                self.state.pending_grants.remove(&ticket_id);
                if self.finish(&ticket_id, RunStatus::Failed, Some(error), now).is_some() {
                    info!(ticket_id = %ticket_id, runner_id = %self.state.runner_id, "ticket failed on leader");
                }
                self.admit()
            }
        }
    }

    /// Record that the leader started the run for `ticket_id`.
    pub fn launched(&mut self, ticket_id: &str, run: RunIdentity, now: DateTime<Utc>) -> Vec<Effect> {
        let Some(ticket) = self.state.tickets.get_mut(ticket_id) else {
            return Vec::new();
        };
        ticket.status = RunStatus::Running;
        ticket.started_at = Some(now);
        ticket.run = Some(run.clone());

        let mut effects: Vec<Effect> = ticket
            .request
            .required_runner_ids
            .iter()
            .filter(|runner| **runner != self.state.runner_id)
            .map(|runner| Effect::Send {
                runner_id: runner.clone(),
                signal: Signal::RunStarted {
                    ticket_id: ticket_id.to_string(),
                    run: run.clone(),
                    started_at: now,
                },
            })
            .collect();
        effects.extend(self.admit());
        effects
    }

    /// Record that the leader could not start the run for `ticket_id`.
    pub fn launch_failed(&mut self, ticket_id: &str, error: String, now: DateTime<Utc>) -> Vec<Effect> {
        let Some((_, _, request)) = self.finish(ticket_id, RunStatus::Failed, Some(error.clone()), now) else {
            return Vec::new();
        };
        let mut effects: Vec<Effect> = request
            .required_runner_ids
            .iter()
            .filter(|runner| **runner != self.state.runner_id)
            .map(|runner| Effect::Send {
                runner_id: runner.clone(),
                signal: Signal::RunFailed {
                    ticket_id: ticket_id.to_string(),
                    error: error.clone(),
                },
            })
            .collect();
        effects.extend(self.admit());
        effects
    }

    /// Recompute queue order and grants.
    pub fn admit(&mut self) -> Vec<Effect> {
        self.reorder();
        let runner_id = self.state.runner_id.clone();
        let capacity = self.state.capacity.max(1);
        let mut effects = Vec::new();

        for (index, ticket_id) in self.state.queue.iter().enumerate() {
            let Some(ticket) = self.state.tickets.get_mut(ticket_id) else {
                continue;
            };
            let leader = &ticket.request.leader_runner_id;
            match ticket.status {
                RunStatus::Queued if index < capacity => {
                    ticket.status = RunStatus::Starting;
                    ticket.granted_runner_ids.insert(runner_id.clone());
                    debug!(ticket_id = %ticket_id, runner_id = %runner_id, "slot granted");
                    if *leader != runner_id {
                        effects.push(Effect::Send {
                            runner_id: leader.clone(),
                            signal: Signal::GrantObserved {
                                ticket_id: ticket_id.clone(),
                                runner_id: runner_id.clone(),
                            },
                        });
                    }
                }
                RunStatus::Starting if index >= capacity => {
                    ticket.status = RunStatus::Queued;
                    ticket.granted_runner_ids.remove(&runner_id);
                    debug!(ticket_id = %ticket_id, runner_id = %runner_id, "slot handed to an earlier ticket");
                    if *leader != runner_id {
                        effects.push(Effect::Send {
                            runner_id: leader.clone(),
                            signal: Signal::GrantRevoked {
                                ticket_id: ticket_id.clone(),
                                runner_id: runner_id.clone(),
                            },
                        });
                    }
                }
                _ => {}
            }
        }

        effects.extend(self.ready_launches());
        effects
    }

    pub fn view(&self, ticket_id: &str) -> Option<RunStatusView> {
        self.state.tickets.get(ticket_id).map(|ticket| self.view_of(ticket))
    }

    fn ready_launches(&self) -> Vec<Effect> {
        self.state
            .tickets
            .values()
            .filter(|ticket| {
                ticket.status == RunStatus::Starting
                    && ticket.request.leader_runner_id == self.state.runner_id
                    && ticket.fully_granted()
            })
            .map(|ticket| Effect::Launch {
                request: ticket.request.clone(),
            })
            .collect()
    }

    fn prune_pending_grants(&mut self, now: DateTime<Utc>) {
        let runner_id = &self.state.runner_id;
        self.state.pending_grants.retain(|ticket_id, early| {
            let fresh = (now - early.observed_at).num_seconds() <= PENDING_GRANT_TTL_SECS;
            if !fresh {
                debug!(ticket_id = %ticket_id, runner_id = %runner_id, "dropping stale early grant");
            }
            fresh
        });
    }

    fn reorder(&mut self) {
        let tickets = &self.state.tickets;
        let (mut ordered, mut waiting): (Vec<String>, Vec<String>) = self.state.queue.drain(..).partition(|ticket_id| {
            tickets
                .get(ticket_id)
                .is_some_and(|ticket| matches!(ticket.status, RunStatus::Running | RunStatus::Canceled))
        });
        waiting.sort_by(|left, right| {
            let left_at = tickets.get(left).map(|ticket| ticket.request.enqueued_at);
            let right_at = tickets.get(right).map(|ticket| ticket.request.enqueued_at);
            left_at.cmp(&right_at).then_with(|| left.cmp(right))
        });
        ordered.append(&mut waiting);
        self.state.queue = ordered;
    }

    /// Move a ticket to a terminal status and evict it.
    ///
    /// Returns the final view, the status it had before, and its request.
    fn finish(
        &mut self,
        ticket_id: &str,
        status: RunStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<(RunStatusView, RunStatus, RunTicketRequest)> {
        let mut ticket = self.state.tickets.shift_remove(ticket_id)?;
        self.state.queue.retain(|queued| queued != ticket_id);

        let previous = ticket.status;
        ticket.status = status;
        ticket.done_at = Some(now);
        if error.is_some() {
            ticket.error = error;
        }
        let view = self.view_of(&ticket);
        Some((view, previous, ticket.request))
    }

    fn owns(&self, ticket_id: &str, owner_namespace: &str) -> bool {
        self.state
            .tickets
            .get(ticket_id)
            .is_some_and(|ticket| ticket.request.owner_namespace == owner_namespace.trim())
    }

    fn not_found(&self, ticket_id: &str, owner_namespace: &str) -> RunStatusView {
        RunStatusView {
            line_len: self.state.queue.len(),
            ..RunStatusView::not_found(ticket_id, owner_namespace)
        }
    }

    fn view_of(&self, ticket: &RunTicketState) -> RunStatusView {
        let position = self
            .state
            .queue
            .iter()
            .position(|queued| *queued == ticket.request.ticket_id)
            .map_or(0, |index| index + 1);
        RunStatusView {
            ticket_id: ticket.request.ticket_id.clone(),
            owner_namespace: ticket.request.owner_namespace.clone(),
            status: ticket.status,
            position,
            line_len: self.state.queue.len(),
            workflow_id: ticket.run.as_ref().map(|run| run.workflow_id.clone()),
            run_id: ticket.run.as_ref().map(|run| run.run_id.clone()),
            namespace: ticket.run.as_ref().map(|run| run.namespace.clone()),
            error: ticket.error.clone(),
            started_at: ticket.started_at,
            done_at: ticket.done_at,
            required_runner_ids: ticket.request.required_runner_ids.clone(),
            granted_runner_ids: ticket.granted_runner_ids.iter().cloned().collect(),
        }
    }
}
