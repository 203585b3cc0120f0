//! # Pipeline Orchestrator
//!
//! Runs the steps of a pipeline in declared order, threading each step's
//! coerced output into the run context under its id:
//!
//! ```text
//! {
//!   "config":  { ...pipeline config with run config on top },
//!   "payload": { ...run payload },
//!   "run":     { workflow_id, run_id, namespace, pipeline_id },
//!   "<step>":  { "outputs": <value> },
//! }
//! ```
//!
//! Steps whose `use` names a custom check run that block inline against a
//! copy of the context that also carries the block's resolved `inputs`.
//! Steps backed by a child-workflow task run a nested pipeline under the
//! workflow id `"{parent}/{step}"`. Both nest at most
//! [`MAX_CUSTOM_CHECK_DEPTH`] levels.
//!
//! The context only ever grows forward in step order, so it is acyclic and
//! reference resolution needs no cycle detection.

use std::sync::Arc;

use futures_util::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use runlane_types::{ActivityOptions, StepDefinition, ValidationErrors, WorkflowBlock, WorkflowDefinition, workflow::MAX_CUSTOM_CHECK_DEPTH};
use serde_json::{Map as JsonMap, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    activity::{ActivityError, ActivityInput, ChildPlan},
    dispatch::{merge_config, resolve_step_inputs},
    error::PipelineError,
    hooks::{CleanupHook, RunReport, SetupHook},
    model::RESERVED_CONTEXT_KEYS,
    registry::{ChildRunner, TaskContext, TaskRegistry},
    resolve::{resolve_reference, resolve_value},
    run::{RunData, RunInfo, RunInput, RunOutcome},
    runtime::ActivityRuntime,
};

#[derive(Clone)]
struct Inner {
    registry: TaskRegistry,
    runtime: ActivityRuntime,
    setup_hooks: Vec<Arc<dyn SetupHook>>,
    cleanup_hooks: Vec<Arc<dyn CleanupHook>>,
}

/// Executes pipelines against a task registry. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// What the step loop needs to know about the pipeline it is running.
#[derive(Clone, Copy)]
struct Scope<'a> {
    definition: &'a WorkflowDefinition,
    config: &'a IndexMap<String, String>,
    run: &'a RunInfo,
    data: &'a RunData,
    depth: usize,
}

struct StepsOutcome {
    context: JsonMap<String, Value>,
    failures: Vec<PipelineError>,
}

impl Orchestrator {
    pub fn new(registry: TaskRegistry, runtime: ActivityRuntime) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                runtime,
                setup_hooks: Vec::new(),
                cleanup_hooks: Vec::new(),
            }),
        }
    }

    pub fn with_setup_hook(mut self, hook: Arc<dyn SetupHook>) -> Self {
        Arc::make_mut(&mut self.inner).setup_hooks.push(hook);
        self
    }

    pub fn with_cleanup_hook(mut self, hook: Arc<dyn CleanupHook>) -> Self {
        Arc::make_mut(&mut self.inner).cleanup_hooks.push(hook);
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub async fn run(&self, definition: &WorkflowDefinition, input: RunInput) -> Result<RunOutcome, PipelineError> {
        self.run_with_cancel(definition, input, CancellationToken::new()).await
    }

    /// Run a pipeline until it finishes, fails, times out, or `cancel` fires.
    ///
    /// Cleanup hooks run afterwards in every case, on their own task and
    /// with their own token.
    pub async fn run_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        input: RunInput,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let data = Arc::new(RunData::new(input.run.clone(), input.ticket.clone()));
        info!(
            workflow_id = %input.run.workflow_id,
            run_id = %input.run.run_id,
            pipeline = %definition.name,
            steps = definition.steps.len(),
            "pipeline run started"
        );

        let run_cancel = cancel.child_token();
        let work = self.execute_root(definition, &input, &data, &run_cancel);
        let result = match definition.runtime.execution_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, work).await {
                Ok(result) => result,
                Err(_) => {
                    run_cancel.cancel();
                    Err(PipelineError::Timeout { timeout })
                }
            },
            None => work.await,
        };

        match &result {
            Ok(_) => info!(workflow_id = %input.run.workflow_id, "pipeline run succeeded"),
            Err(error) => warn!(workflow_id = %input.run.workflow_id, code = error.code(), error = %error, "pipeline run failed"),
        }

        self.run_cleanup_hooks(RunReport::new(&input.run, &result), data).await;
        result.map(|outputs| RunOutcome { run: input.run, outputs })
    }

    async fn execute_root(
        &self,
        definition: &WorkflowDefinition,
        input: &RunInput,
        data: &RunData,
        cancel: &CancellationToken,
    ) -> Result<JsonMap<String, Value>, PipelineError> {
        let mut steps = definition.steps.clone();
        for hook in &self.inner.setup_hooks {
            if cancel.is_cancelled() {
                return Err(PipelineError::Canceled);
            }
            debug!(hook = hook.name(), "running setup hook");
            hook.setup(&mut steps, data).await.map_err(|error| match error {
                hooked @ PipelineError::Hook { .. } => hooked,
                other => PipelineError::hook(hook.name(), other.to_string()),
            })?;
        }

        let config = merge_config(&definition.config, &input.config);
        let scope = Scope {
            definition,
            config: &config,
            run: &input.run,
            data,
            depth: 0,
        };
        let context = base_context(&config, &input.payload, &input.run);
        let outcome = self.execute_steps(scope, &steps, context, cancel).await?;
        let outputs = public_outputs(outcome.context);
        if outcome.failures.is_empty() {
            Ok(outputs)
        } else {
            Err(PipelineError::Failed {
                count: outcome.failures.len(),
                causes: outcome.failures,
                outputs,
            })
        }
    }

    fn execute_steps<'a>(
        &'a self,
        scope: Scope<'a>,
        steps: &'a [StepDefinition],
        mut context: JsonMap<String, Value>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepsOutcome, PipelineError>> {
        async move {
            let mut failures = Vec::new();
            for step in steps {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Canceled);
                }
                match self.execute_step(scope, step, &context, cancel).await {
                    Ok(value) => {
                        debug!(workflow_id = %scope.run.workflow_id, step_id = %step.id, "step finished");
                        context.insert(step.id.clone(), json!({ "outputs": value }));
                    }
                    Err(error) if step.continue_on_error && !matches!(error, PipelineError::Canceled) => {
                        warn!(workflow_id = %scope.run.workflow_id, step_id = %step.id, error = %error, "step failed; continuing");
                        if let Some(partial) = partial_output(&error) {
                            context.insert(step.id.clone(), json!({ "outputs": partial }));
                        }
                        failures.push(error);
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok(StepsOutcome { context, failures })
        }
        .boxed()
    }

    async fn execute_step(
        &self,
        scope: Scope<'_>,
        step: &StepDefinition,
        context: &JsonMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        let context_value = Value::Object(context.clone());
        if let Some(block) = scope.definition.custom_checks.get(&step.uses) {
            return self.execute_custom_check(scope, step, block, &context_value, cancel).await;
        }

        let entry = self.inner.registry.get(&step.uses).ok_or_else(|| PipelineError::UnknownTask {
            step_id: step.id.clone(),
            uses: step.uses.clone(),
        })?;
        let resolved = resolve_step_inputs(step, scope.config, &context_value, &entry.verbatim_keys)?;
        let input = ActivityInput {
            step_id: step.id.clone(),
            payload: resolved.payload,
            config: resolved.config,
            run: scope.run.clone(),
        };
        let options = step_options(scope.definition, step);
        let children = ChildScope {
            orchestrator: self,
            data: scope.data,
            depth: scope.depth,
        };

        debug!(workflow_id = %scope.run.workflow_id, step_id = %step.id, task = %entry.key, queue = %entry.queue, "dispatching step");
        let output = entry
            .kind
            .execute(
                input,
                entry.output,
                TaskContext {
                    runtime: &self.inner.runtime,
                    options: &options,
                    children: &children,
                    cancel,
                },
            )
            .await
            .map_err(|source| match source {
                ActivityError::Canceled if cancel.is_cancelled() => PipelineError::Canceled,
                source => PipelineError::Step {
                    step_id: step.id.clone(),
                    source,
                },
            })?;

        for compensation in output.compensation {
            debug!(step_id = %step.id, cleanup = %compensation.name, "registering cleanup step");
            scope.data.push_cleanup(compensation);
        }
        Ok(output.value)
    }

    async fn execute_custom_check(
        &self,
        scope: Scope<'_>,
        step: &StepDefinition,
        block: &WorkflowBlock,
        context: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        if scope.depth >= MAX_CUSTOM_CHECK_DEPTH {
            return Err(PipelineError::Invalid(ValidationErrors::single(
                format!("custom_checks.{}", step.uses),
                format!("custom checks nest deeper than {MAX_CUSTOM_CHECK_DEPTH} levels"),
            )));
        }

        let resolved = resolve_step_inputs(step, scope.config, context, &[])?;
        let mut inputs = JsonMap::new();
        for name in &block.inputs {
            let value = match resolved.payload.get(name) {
                Some(value) => value.clone(),
                None => resolve_reference(name, context).map_err(|source| PipelineError::Expression {
                    step_id: step.id.clone(),
                    source,
                })?,
            };
            inputs.insert(name.clone(), value);
        }

        let run = scope.run.child(&step.id, &step.uses);
        let mut child_context = match context {
            Value::Object(map) => map.clone(),
            _ => JsonMap::new(),
        };
        child_context.insert("config".into(), config_value(&resolved.config));
        child_context.insert("run".into(), run_value(&run));
        child_context.insert("inputs".into(), Value::Object(inputs));

        info!(workflow_id = %run.workflow_id, step_id = %step.id, check = %step.uses, "running custom check");
        let child_scope = Scope {
            definition: scope.definition,
            config: &resolved.config,
            run: &run,
            data: scope.data,
            depth: scope.depth + 1,
        };
        let nested = |source: PipelineError| PipelineError::Nested {
            step_id: step.id.clone(),
            source: Box::new(source),
        };
        let outcome = self
            .execute_steps(child_scope, &block.steps, child_context, cancel)
            .await
            .map_err(|error| match error {
                PipelineError::Canceled => PipelineError::Canceled,
                other => nested(other),
            })?;

        if !outcome.failures.is_empty() {
            return Err(nested(PipelineError::Failed {
                count: outcome.failures.len(),
                causes: outcome.failures,
                outputs: block_step_outputs(block, &outcome.context),
            }));
        }
        if block.outputs.is_empty() {
            return Ok(Value::Object(block_step_outputs(block, &outcome.context)));
        }

        let merged = Value::Object(outcome.context);
        let mut outputs = JsonMap::new();
        for (name, expression) in &block.outputs {
            let value = resolve_value(expression, &merged).map_err(|source| PipelineError::Expression {
                step_id: step.id.clone(),
                source,
            })?;
            outputs.insert(name.clone(), value);
        }
        Ok(Value::Object(outputs))
    }

    async fn run_cleanup_hooks(&self, report: RunReport, data: Arc<RunData>) {
        if self.inner.cleanup_hooks.is_empty() {
            return;
        }
        let hooks = self.inner.cleanup_hooks.clone();
        let workflow_id = report.run.workflow_id.clone();
        let chain = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for hook in hooks {
                debug!(hook = hook.name(), workflow_id = %report.run.workflow_id, "running cleanup hook");
                if let Err(error) = hook.cleanup(&report, &data, &cancel).await {
                    error!(hook = hook.name(), workflow_id = %report.run.workflow_id, error = %format!("{error:#}"), "cleanup hook failed");
                }
            }
        });
        if let Err(error) = chain.await {
            error!(workflow_id = %workflow_id, error = %error, "cleanup hook chain aborted");
        }
    }
}

/// Runs nested pipelines for child-workflow tasks within one run.
struct ChildScope<'s> {
    orchestrator: &'s Orchestrator,
    data: &'s RunData,
    depth: usize,
}

impl ChildRunner for ChildScope<'_> {
    fn run_child<'a>(
        &'a self,
        step_id: &'a str,
        plan: ChildPlan,
        parent: &'a ActivityInput,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, ActivityError>> {
        async move {
            if self.depth >= MAX_CUSTOM_CHECK_DEPTH {
                return Err(ActivityError::non_retryable(
                    "CHILD_DEPTH",
                    format!("child pipelines nest deeper than {MAX_CUSTOM_CHECK_DEPTH} levels"),
                ));
            }
            let ChildPlan {
                definition,
                config,
                payload,
            } = plan;
            let run = parent.run.child(step_id, &definition.name);
            let config = merge_config(&definition.config, &config);
            info!(workflow_id = %run.workflow_id, step_id, pipeline = %definition.name, "starting child pipeline");

            let scope = Scope {
                definition: &definition,
                config: &config,
                run: &run,
                data: self.data,
                depth: self.depth + 1,
            };
            let context = base_context(&config, &payload, &run);
            let work = self.orchestrator.execute_steps(scope, &definition.steps, context, &cancel);
            let result = match definition.runtime.execution_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(PipelineError::Timeout { timeout })
                    }
                },
                None => work.await,
            };

            match result {
                Ok(outcome) if outcome.failures.is_empty() => Ok(Value::Object(public_outputs(outcome.context))),
                Ok(outcome) => {
                    let failed = PipelineError::Failed {
                        count: outcome.failures.len(),
                        causes: outcome.failures,
                        outputs: JsonMap::new(),
                    };
                    Err(ActivityError::non_retryable("CHILD_FAILED", failed.to_string()))
                }
                Err(PipelineError::Canceled) => Err(ActivityError::Canceled),
                Err(error) => Err(ActivityError::non_retryable("CHILD_FAILED", error.to_string())),
            }
        }
        .boxed()
    }
}

/// Step options over the pipeline's retry policy; runtime defaults apply underneath.
fn step_options(definition: &WorkflowDefinition, step: &StepDefinition) -> ActivityOptions {
    let pipeline = ActivityOptions {
        retry: definition.runtime.retry.clone(),
        ..Default::default()
    };
    step.activity_options.clone().unwrap_or_default().layered_over(&pipeline)
}

fn base_context(config: &IndexMap<String, String>, payload: &JsonMap<String, Value>, run: &RunInfo) -> JsonMap<String, Value> {
    let mut context = JsonMap::new();
    context.insert("config".into(), config_value(config));
    context.insert("payload".into(), Value::Object(payload.clone()));
    context.insert("run".into(), run_value(run));
    context
}

fn config_value(config: &IndexMap<String, String>) -> Value {
    Value::Object(
        config
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect(),
    )
}

fn run_value(run: &RunInfo) -> Value {
    serde_json::to_value(run).unwrap_or(Value::Null)
}

/// Step entries only; the reserved keys never leave the orchestrator.
fn public_outputs(context: JsonMap<String, Value>) -> JsonMap<String, Value> {
    context
        .into_iter()
        .filter(|(key, _)| !RESERVED_CONTEXT_KEYS.contains(&key.as_str()))
        .collect()
}

fn block_step_outputs(block: &WorkflowBlock, context: &JsonMap<String, Value>) -> JsonMap<String, Value> {
    block
        .steps
        .iter()
        .filter_map(|step| context.get(&step.id).map(|entry| (step.id.clone(), entry.clone())))
        .collect()
}

/// Output kept under a continue-on-error step that failed part-way.
fn partial_output(error: &PipelineError) -> Option<Value> {
    match error {
        PipelineError::Nested { source, .. } => source
            .partial_outputs()
            .filter(|outputs| !outputs.is_empty())
            .map(|outputs| Value::Object(outputs.clone())),
        _ => None,
    }
}
