//! Admission-control data: tickets, per-runner semaphore state, and the
//! status views returned by the runner queue.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Lifecycle of a ticket on one runner.
///
/// `NotFound` is only ever an answer, never a stored state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotFound,
    Queued,
    Starting,
    Running,
    Done,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Rank used when folding per-runner answers into one view.
    ///
    /// `failed`/`canceled` > `running` > `starting` > `queued` > `done` > `not_found`.
    pub fn priority(self) -> u8 {
        match self {
            RunStatus::Failed | RunStatus::Canceled => 5,
            RunStatus::Running => 4,
            RunStatus::Starting => 3,
            RunStatus::Queued => 2,
            RunStatus::Done => 1,
            RunStatus::NotFound => 0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Canceled)
    }

    /// Ticket still occupies (or waits for) a queue slot.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Starting | RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotFound => "not_found",
            RunStatus::Queued => "queued",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

/// Request to admit one pipeline run onto one or more runners.
///
/// Built once by the ticket coordinator and replicated verbatim to every
/// required runner's semaphore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTicketRequest {
    pub ticket_id: String,
    pub owner_namespace: String,
    pub enqueued_at: DateTime<Utc>,
    /// Normalized (trimmed, de-duplicated, sorted) runner ids.
    pub required_runner_ids: Vec<String>,
    /// Runner whose semaphore launches the run once every runner granted it.
    pub leader_runner_id: String,
    /// Reject when the runner's queue already holds this many tickets; `0` disables the limit.
    #[serde(default)]
    pub max_queue_depth: usize,
    pub pipeline_id: String,
    pub pipeline_source: String,
    #[serde(default)]
    pub pipeline_config: IndexMap<String, String>,
    #[serde(default)]
    pub memo: JsonMap<String, JsonValue>,
}

/// Identity of a started pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunIdentity {
    pub workflow_id: String,
    pub run_id: String,
    pub namespace: String,
}

/// Everything a semaphore knows about one ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTicketState {
    pub request: RunTicketRequest,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
    /// Runners known to have granted this ticket a slot.
    #[serde(default)]
    pub granted_runner_ids: BTreeSet<String>,
    #[serde(default)]
    pub run: Option<RunIdentity>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunTicketState {
    pub fn new(request: RunTicketRequest) -> Self {
        Self {
            request,
            status: RunStatus::Queued,
            started_at: None,
            done_at: None,
            granted_runner_ids: BTreeSet::new(),
            run: None,
            error: None,
        }
    }

    /// True once every required runner recorded a grant.
    pub fn fully_granted(&self) -> bool {
        self.request
            .required_runner_ids
            .iter()
            .all(|runner| self.granted_runner_ids.contains(runner))
    }
}

/// Durable state of one runner's semaphore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemaphoreState {
    pub runner_id: String,
    pub capacity: usize,
    /// Ticket ids holding or waiting for a slot, granted tickets first.
    pub queue: Vec<String>,
    pub tickets: IndexMap<String, RunTicketState>,
    /// Grants a leader observed before the ticket itself was enqueued locally.
    #[serde(default)]
    pub pending_grants: BTreeMap<String, PendingGrant>,
}

/// Early grants for a ticket the leader has not seen yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingGrant {
    pub runner_ids: BTreeSet<String>,
    /// When the first grant arrived; stale entries are pruned.
    pub observed_at: DateTime<Utc>,
}

impl SemaphoreState {
    pub fn new(runner_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            runner_id: runner_id.into(),
            capacity: capacity.max(1),
            queue: Vec::new(),
            tickets: IndexMap::new(),
            pending_grants: BTreeMap::new(),
        }
    }
}

/// Read-only view of a ticket as seen by one runner (or folded across runners).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunStatusView {
    pub ticket_id: String,
    pub owner_namespace: String,
    pub status: RunStatus,
    /// 1-based position in the runner queue; `0` when not queued.
    pub position: usize,
    /// Number of tickets in the runner queue.
    pub line_len: usize,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required_runner_ids: Vec<String>,
    #[serde(default)]
    pub granted_runner_ids: Vec<String>,
}

impl RunStatusView {
    pub fn not_found(ticket_id: impl Into<String>, owner_namespace: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            owner_namespace: owner_namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == RunStatus::NotFound
    }
}

/// Answer to an enqueue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EnqueueResponse {
    pub ticket_id: String,
    pub status: RunStatus,
    pub position: usize,
    pub line_len: usize,
}

impl From<&RunStatusView> for EnqueueResponse {
    fn from(view: &RunStatusView) -> Self {
        Self {
            ticket_id: view.ticket_id.clone(),
            status: view.status,
            position: view.position,
            line_len: view.line_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_statuses() {
        let mut statuses = vec![
            RunStatus::Queued,
            RunStatus::NotFound,
            RunStatus::Failed,
            RunStatus::Running,
            RunStatus::Starting,
        ];
        statuses.sort_by_key(|status| std::cmp::Reverse(status.priority()));
        assert_eq!(
            statuses,
            vec![
                RunStatus::Failed,
                RunStatus::Running,
                RunStatus::Starting,
                RunStatus::Queued,
                RunStatus::NotFound
            ]
        );
        assert_eq!(RunStatus::Canceled.priority(), RunStatus::Failed.priority());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::NotFound).unwrap(), "\"not_found\"");
        assert!(RunStatus::Done.is_terminal());
        assert!(!RunStatus::Starting.is_terminal());
    }
}
