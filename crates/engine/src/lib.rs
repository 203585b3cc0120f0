//! # Runlane Engine
//!
//! Parses declarative pipelines and runs them step by step, threading each
//! step's output into a run context that later steps reference with
//! `${{ step.outputs.field }}` expressions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use runlane_engine::{ActivityRuntime, Orchestrator, RunInfo, RunInput, builtin_registry, parse_pipeline};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let definition = parse_pipeline(
//!     r#"
//! name: hello
//! steps:
//!   - id: greet
//!     use: core/echo
//!     with:
//!       payload:
//!         message: hi
//! "#,
//! )?;
//! let orchestrator = Orchestrator::new(builtin_registry()?, ActivityRuntime::default());
//! let outcome = orchestrator.run(&definition, RunInput::new(RunInfo::generate("default", "hello"))).await?;
//! println!("{}", serde_json::Value::Object(outcome.outputs));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`resolve`**: `${{ }}` reference parsing and resolution
//! - **`model`**: pipeline loading and validation
//! - **`dispatch`**: per-step config merging and input resolution
//! - **`registry`** / **`tasks`**: the task table and the built-in tasks
//! - **`runtime`**: per-activity timeouts and retries
//! - **`orchestrator`** / **`hooks`**: the step loop and its setup/cleanup chains
//! - **`service`**: submission, admission, and the run launcher

pub mod activity;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod resolve;
pub mod run;
pub mod runtime;
pub mod service;
pub mod tasks;

pub use activity::{Activity, ActivityError, ActivityInput, ChildPlan, ChildWorkflowTask};
pub use error::PipelineError;
pub use hooks::{
    CleanupHook, CleanupSagaHook, RecordStoreRunnerDirectory, ResultCallbackHook, RunReleaseHook, RunReport, RunnerAdmissionHook,
    RunnerDirectory, SetupHook, StaticRunnerDirectory,
};
pub use model::{load_pipeline_file, parse_pipeline};
pub use orchestrator::Orchestrator;
pub use registry::{OutputKind, TaskEntry, TaskKind, TaskRegistry, TaskRegistryBuilder};
pub use resolve::{ExpressionError, resolve_string, resolve_value};
pub use run::{RunData, RunInfo, RunInput, RunOutcome};
pub use runtime::ActivityRuntime;
pub use service::{PipelineService, ServiceError, StandardHooks, Submission, standard_orchestrator};
pub use tasks::{builtin_registry, builtin_tasks};
