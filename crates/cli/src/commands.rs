use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use runlane_admission::{FileSemaphoreStore, SemaphoreMachine, SemaphoreStore};
use runlane_api::{DEFAULT_REQUEST_TIMEOUT, HostClient, RecordStoreClient, build_http_client};
use runlane_cleanup::{CleanupActionRegistry, FailedCleanupStore, RecordStoreFailedCleanups, Reconciler};
use runlane_engine::{ActivityRuntime, CleanupSagaHook, Orchestrator, RunInfo, RunInput, builtin_registry, parse_pipeline};
use runlane_util::redact_sensitive;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{EndpointConfig, RunlaneConfig};

/// Parse repeated `key=value` flags into pipeline config overrides.
pub fn parse_config_pairs(pairs: &[String]) -> Result<IndexMap<String, String>> {
    let mut config = IndexMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("config override '{pair}' must look like key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("config override '{pair}' has an empty key");
        }
        config.insert(key.to_string(), value.to_string());
    }
    Ok(config)
}

fn read_pipeline(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read pipeline {}", path.display()))
}

fn host_client(endpoint: Option<&EndpointConfig>) -> Result<Option<HostClient>> {
    endpoint
        .map(|endpoint| HostClient::new(&endpoint.base_url, endpoint.token.as_deref()))
        .transpose()
}

/// Run a runner-less pipeline in this process and print its outputs.
pub async fn run(config: &RunlaneConfig, file: &Path, overrides: &[String]) -> Result<()> {
    let source = read_pipeline(file)?;
    let definition = parse_pipeline(&source).map_err(|errors| anyhow!("{}: {errors}", file.display()))?;
    if definition.requires_runners() {
        bail!("pipeline '{}' needs mobile runners; use `runlane submit` instead", definition.name);
    }

    let actions = Arc::new(CleanupActionRegistry::with_defaults(host_client(config.host.as_ref())?)?);
    let orchestrator = Orchestrator::new(builtin_registry()?, ActivityRuntime::new(config.activity.clone()))
        .with_cleanup_hook(Arc::new(CleanupSagaHook::new(actions)));

    let namespace = definition.runtime.namespace.clone().unwrap_or_else(|| config.namespace.clone());
    let mut input = RunInput::new(RunInfo::generate(namespace, &definition.name));
    input.config = parse_config_pairs(overrides)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; canceling run");
            interrupt.cancel();
        }
    });

    let outcome = orchestrator
        .run_with_cancel(&definition, input, cancel)
        .await
        .with_context(|| format!("pipeline '{}' failed", definition.name))?;
    info!(workflow_id = %outcome.run.workflow_id, steps = outcome.outputs.len(), "pipeline finished");
    println!("{}", serde_json::to_string_pretty(&Value::Object(outcome.outputs))?);
    Ok(())
}

/// Returns `true` when the pipeline is valid.
pub fn validate(file: &Path) -> Result<bool> {
    let source = read_pipeline(file)?;
    match parse_pipeline(&source) {
        Ok(definition) => {
            println!("{}: ok ({} steps)", definition.name, definition.steps.len());
            Ok(true)
        }
        Err(errors) => {
            for error in &errors.errors {
                println!("{}: {}", error.field, error.message);
            }
            Ok(false)
        }
    }
}

/// POST the raw pipeline text to a start endpoint.
pub async fn submit(file: &Path, endpoint: &str, token: Option<&str>) -> Result<()> {
    let source = read_pipeline(file)?;
    let client = build_http_client(token, DEFAULT_REQUEST_TIMEOUT)?;
    let response = client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(source)
        .send()
        .await
        .with_context(|| format!("POST {endpoint}"))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("{endpoint} answered HTTP {}: {}", status.as_u16(), redact_sensitive(&body));
    }
    let rendered = serde_json::from_str::<Value>(&body)
        .ok()
        .map(|value| serde_json::to_string_pretty(&value))
        .transpose()?
        .unwrap_or(body);
    println!("{rendered}");
    Ok(())
}

/// Print the tickets a runner's semaphore holds, in queue order.
pub async fn queue(config: &RunlaneConfig, runner_id: &str) -> Result<()> {
    let store = FileSemaphoreStore::new(&config.state_dir);
    let Some(state) = store
        .load(runner_id)
        .await
        .with_context(|| format!("load semaphore state for runner '{runner_id}'"))?
    else {
        println!("runner '{runner_id}' has no semaphore state under {}", config.state_dir.display());
        return Ok(());
    };

    let capacity = state.capacity;
    let queue = state.queue.clone();
    let machine = SemaphoreMachine::new(state);
    let entries: Vec<Value> = queue
        .iter()
        .filter_map(|ticket_id| machine.view(ticket_id))
        .map(|view| serde_json::to_value(view).unwrap_or(Value::Null))
        .collect();
    let listing = json!({
        "runner_id": runner_id,
        "capacity": capacity,
        "tickets": entries,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Retry failed cleanups recorded in the record store.
pub async fn reconcile(config: &RunlaneConfig, iterations: Option<u32>) -> Result<()> {
    let endpoint = config
        .record_store
        .as_ref()
        .context("reconcile needs a record store; set record_store in the config or RUNLANE_RECORD_STORE_URL")?;
    let client = RecordStoreClient::new(&endpoint.base_url, endpoint.token.as_deref())?;
    let store: Arc<dyn FailedCleanupStore> = Arc::new(RecordStoreFailedCleanups::new(client));
    let actions = Arc::new(CleanupActionRegistry::with_defaults(host_client(config.host.as_ref())?)?);

    let mut reconciler = Reconciler::new(store, actions)
        .with_interval(config.cleanup.reconcile_interval)
        .with_retry_ceiling(config.cleanup.reconcile_max_retries);
    if let Some(iterations) = iterations {
        reconciler = reconciler.with_iterations(iterations);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let summary = reconciler.run(cancel).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
