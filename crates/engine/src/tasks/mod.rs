//! Built-in task implementations and the default task table.

use std::sync::Arc;

pub mod basic;
pub mod http;
pub mod mobile;
pub mod pipeline;

pub use self::basic::{EchoActivity, FailActivity, SleepActivity, TemplateActivity, render_template};
pub use self::http::HttpRequestActivity;
pub use self::mobile::MobileSessionActivity;
pub use self::pipeline::PipelineRunTask;

use crate::registry::{MOBILE_QUEUE, OutputKind, TaskEntry, TaskRegistry, TaskRegistryBuilder};

/// Builder pre-loaded with every built-in task, ready for extra entries.
pub fn builtin_tasks() -> anyhow::Result<TaskRegistryBuilder> {
    Ok(TaskRegistry::builder()
        .register(TaskEntry::activity("core/echo", Arc::new(EchoActivity), OutputKind::Map))
        .register(
            TaskEntry::activity("core/template", Arc::new(TemplateActivity), OutputKind::String)
                .verbatim([TemplateActivity::TEMPLATE_KEY]),
        )
        .register(TaskEntry::activity("core/fail", Arc::new(FailActivity), OutputKind::Raw))
        .register(TaskEntry::activity("core/sleep", Arc::new(SleepActivity), OutputKind::Map))
        .register(TaskEntry::activity("http/request", Arc::new(HttpRequestActivity::new()?), OutputKind::Raw))
        .register(TaskEntry::child("pipeline/run", Arc::new(PipelineRunTask)).verbatim([pipeline::SOURCE_KEY]))
        .register(
            TaskEntry::activity("mobile/session", Arc::new(MobileSessionActivity::new()?), OutputKind::Map).on_queue(MOBILE_QUEUE),
        ))
}

pub fn builtin_registry() -> anyhow::Result<TaskRegistry> {
    Ok(builtin_tasks()?.build())
}
