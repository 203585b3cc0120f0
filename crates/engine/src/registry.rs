//! Static table from task key to task implementation.
//!
//! Built once at process start with [`TaskRegistryBuilder`] and read-only
//! afterwards. Each entry says whether the key runs as an activity or as a
//! child pipeline, how its raw result is coerced, and which worker queue it
//! belongs to.

use std::{collections::HashSet, fmt, sync::Arc};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use runlane_types::{ActivityOptions, CleanupStepSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    activity::{Activity, ActivityError, ActivityInput, ChildPlan, ChildWorkflowTask},
    resolve::stringify,
    runtime::ActivityRuntime,
};

pub const DEFAULT_QUEUE: &str = "default";
pub const MOBILE_QUEUE: &str = "mobile";

/// Task keys generic worker pools must not pick up.
pub const DEFAULT_POOL_DENYLIST: &[&str] = &["mobile/session"];

/// How a task's raw result is coerced before it enters the run context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Map,
    String,
    Boolean,
    StringList,
    MapList,
    #[default]
    Raw,
}

impl OutputKind {
    pub fn coerce(self, value: Value) -> Result<Value, ActivityError> {
        match (self, value) {
            (OutputKind::Raw, value) => Ok(value),
            (OutputKind::Map, Value::Null) => Ok(Value::Object(JsonMap::new())),
            (OutputKind::Map, value @ Value::Object(_)) => Ok(value),
            (OutputKind::String, value) => Ok(Value::String(stringify(&value))),
            (OutputKind::Boolean, value @ Value::Bool(_)) => Ok(value),
            (OutputKind::Boolean, Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(coercion_error(self, &Value::String(text))),
            },
            (OutputKind::StringList, Value::Array(items)) if items.iter().all(Value::is_string) => Ok(Value::Array(items)),
            (OutputKind::MapList, Value::Array(items)) if items.iter().all(Value::is_object) => Ok(Value::Array(items)),
            (kind, value) => Err(coercion_error(kind, &value)),
        }
    }
}

fn coercion_error(kind: OutputKind, value: &Value) -> ActivityError {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    };
    ActivityError::non_retryable("OUTPUT_TYPE", format!("expected {kind:?} output, got {found}"))
}

/// Activity or child pipeline.
#[derive(Clone)]
pub enum TaskKind {
    Activity(Arc<dyn Activity>),
    ChildWorkflow(Arc<dyn ChildWorkflowTask>),
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Activity(activity) => write!(f, "Activity({})", activity.name()),
            TaskKind::ChildWorkflow(task) => write!(f, "ChildWorkflow({})", task.name()),
        }
    }
}

/// Runs child pipelines on behalf of a [`TaskKind::ChildWorkflow`] entry.
pub trait ChildRunner: Send + Sync {
    fn run_child<'a>(
        &'a self,
        step_id: &'a str,
        plan: ChildPlan,
        parent: &'a ActivityInput,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, ActivityError>>;
}

/// What a task produced for its step.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub value: Value,
    pub compensation: Vec<CleanupStepSpec>,
}

/// Everything [`TaskKind::execute`] needs besides the input.
pub struct TaskContext<'a> {
    pub runtime: &'a ActivityRuntime,
    pub options: &'a ActivityOptions,
    pub children: &'a dyn ChildRunner,
    pub cancel: &'a CancellationToken,
}

impl TaskKind {
    pub fn name(&self) -> &str {
        match self {
            TaskKind::Activity(activity) => activity.name(),
            TaskKind::ChildWorkflow(task) => task.name(),
        }
    }

    /// Run the task for one step and coerce its result.
    ///
    /// Activities go through the runtime's timeout and retry handling;
    /// child pipelines run once under a token derived from the parent's.
    pub async fn execute(&self, input: ActivityInput, output: OutputKind, context: TaskContext<'_>) -> Result<TaskOutput, ActivityError> {
        match self {
            TaskKind::Activity(activity) => {
                let input = activity.configure(input)?;
                let raw = context
                    .runtime
                    .invoke(&input.step_id, activity.as_ref(), &input, context.options, context.cancel)
                    .await?;
                let value = output.coerce(raw)?;
                let compensation = activity.compensation(&input, &value);
                Ok(TaskOutput { value, compensation })
            }
            TaskKind::ChildWorkflow(task) => {
                let plan = task.plan(&input)?;
                let raw = context
                    .children
                    .run_child(&input.step_id, plan, &input, context.cancel.child_token())
                    .await?;
                Ok(TaskOutput {
                    value: output.coerce(raw)?,
                    compensation: Vec::new(),
                })
            }
        }
    }
}

/// One registered task key.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub key: String,
    pub kind: TaskKind,
    pub output: OutputKind,
    pub queue: String,
    /// Payload keys passed through without interpolation.
    pub verbatim_keys: Vec<String>,
}

impl TaskEntry {
    pub fn activity(key: impl Into<String>, activity: Arc<dyn Activity>, output: OutputKind) -> Self {
        Self {
            key: key.into(),
            kind: TaskKind::Activity(activity),
            output,
            queue: DEFAULT_QUEUE.into(),
            verbatim_keys: Vec::new(),
        }
    }

    pub fn child(key: impl Into<String>, task: Arc<dyn ChildWorkflowTask>) -> Self {
        Self {
            key: key.into(),
            kind: TaskKind::ChildWorkflow(task),
            output: OutputKind::Raw,
            queue: DEFAULT_QUEUE.into(),
            verbatim_keys: Vec::new(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn verbatim<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verbatim_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    entries: IndexMap<String, TaskEntry>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a later entry for the same key replaces the earlier one.
    pub fn register(mut self, entry: TaskEntry) -> Self {
        if self.entries.contains_key(&entry.key) {
            warn!(task = %entry.key, "task key registered twice; keeping the later entry");
        }
        self.entries.insert(entry.key.clone(), entry);
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            entries: Arc::new(self.entries),
        }
    }
}

/// Read-only task table, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    entries: Arc<IndexMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn get(&self, key: &str) -> Option<&TaskEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy without the denied keys, for generic worker pools.
    pub fn filtered(&self, denylist: &[&str]) -> TaskRegistry {
        let denied: HashSet<&str> = denylist.iter().copied().collect();
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| !denied.contains(key.as_str()))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        TaskRegistry {
            entries: Arc::new(entries),
        }
    }
}
