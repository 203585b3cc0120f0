//! Per-run data shared between the orchestrator, its tasks, and its hooks.

use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use runlane_cleanup::CleanupSaga;
use runlane_types::{CleanupStepSpec, RunIdentity, RunTicketRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// Identity of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub workflow_id: String,
    pub run_id: String,
    pub namespace: String,
    pub pipeline_id: String,
}

impl RunInfo {
    /// A fresh run of `pipeline_id` with generated ids.
    pub fn generate(namespace: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        let pipeline_id = pipeline_id.into();
        Self {
            workflow_id: format!("{pipeline_id}-{}", uuid::Uuid::new_v4()),
            run_id: uuid::Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            pipeline_id,
        }
    }

    /// Child run dispatched from `step_id`.
    pub fn child(&self, step_id: &str, pipeline_id: impl Into<String>) -> Self {
        Self {
            workflow_id: format!("{}/{step_id}", self.workflow_id),
            run_id: uuid::Uuid::new_v4().to_string(),
            namespace: self.namespace.clone(),
            pipeline_id: pipeline_id.into(),
        }
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Inputs of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInput {
    pub run: RunInfo,
    /// Layered over the pipeline's own config.
    pub config: IndexMap<String, String>,
    pub payload: JsonMap<String, Value>,
    /// Admission ticket when the run holds runner slots.
    pub ticket: Option<RunTicketRequest>,
}

impl RunInput {
    pub fn new(run: RunInfo) -> Self {
        Self {
            run,
            ..Default::default()
        }
    }
}

/// Result of a successful run: every step's entry in the run context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run: RunInfo,
    /// `step_id -> {"outputs": value}` for every step that produced an output.
    pub outputs: JsonMap<String, Value>,
}

impl RunOutcome {
    /// The coerced output of `step_id`.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id).and_then(|entry| entry.get("outputs"))
    }
}

/// State shared by the steps and hooks of one run.
///
/// Activities append compensating steps here as they acquire resources;
/// setup hooks stamp values that cleanup hooks read back.
#[derive(Debug)]
pub struct RunData {
    run: RunInfo,
    ticket: Option<RunTicketRequest>,
    saga: Mutex<CleanupSaga>,
    values: Mutex<JsonMap<String, Value>>,
}

impl RunData {
    pub fn new(run: RunInfo, ticket: Option<RunTicketRequest>) -> Self {
        Self {
            run,
            ticket,
            saga: Mutex::new(CleanupSaga::new()),
            values: Mutex::new(JsonMap::new()),
        }
    }

    pub fn run(&self) -> &RunInfo {
        &self.run
    }

    pub fn ticket(&self) -> Option<&RunTicketRequest> {
        self.ticket.as_ref()
    }

    pub fn push_cleanup(&self, step: CleanupStepSpec) {
        lock(&self.saga).push(step);
    }

    /// Snapshot of the saga accumulated so far.
    pub fn cleanup_saga(&self) -> CleanupSaga {
        lock(&self.saga).clone()
    }

    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        lock(&self.values).insert(key.into(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    pub fn values(&self) -> JsonMap<String, Value> {
        lock(&self.values).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
