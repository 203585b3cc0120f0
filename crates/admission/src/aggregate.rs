//! Folding per-runner status views into one answer.

use std::collections::BTreeSet;

use runlane_types::{RunStatus, RunStatusView};

/// Combine the views a multi-runner ticket has on each of its runners.
///
/// - the highest-priority status wins ([`RunStatus::priority`]);
/// - position and line length take the maximum observed;
/// - the run identity comes from the first runner reporting `running`;
/// - the first error message reported by a `failed` runner is kept.
///
/// An empty slice yields `not_found` with position and line length `0`.
pub fn aggregate_runner_statuses(views: &[RunStatusView]) -> RunStatusView {
    let Some(first) = views.first() else {
        return RunStatusView::default();
    };

    let mut aggregate = RunStatusView {
        ticket_id: first.ticket_id.clone(),
        owner_namespace: first.owner_namespace.clone(),
        ..RunStatusView::default()
    };
    let mut granted = BTreeSet::new();

    for view in views {
        if aggregate.ticket_id.is_empty() {
            aggregate.ticket_id = view.ticket_id.clone();
        }
        if aggregate.owner_namespace.is_empty() {
            aggregate.owner_namespace = view.owner_namespace.clone();
        }
        if view.status.priority() > aggregate.status.priority() {
            aggregate.status = view.status;
        }
        aggregate.position = aggregate.position.max(view.position);
        aggregate.line_len = aggregate.line_len.max(view.line_len);

        if view.status == RunStatus::Running && aggregate.workflow_id.is_none() {
            aggregate.workflow_id = view.workflow_id.clone();
            aggregate.run_id = view.run_id.clone();
            aggregate.namespace = view.namespace.clone();
            aggregate.started_at = view.started_at;
        }
        if view.status == RunStatus::Failed && aggregate.error.is_none() {
            aggregate.error = view.error.clone();
        }
        aggregate.done_at = aggregate.done_at.max(view.done_at);
        if aggregate.required_runner_ids.is_empty() {
            aggregate.required_runner_ids = view.required_runner_ids.clone();
        }
        granted.extend(view.granted_runner_ids.iter().cloned());
    }

    aggregate.granted_runner_ids = granted.into_iter().collect();
    aggregate
}
