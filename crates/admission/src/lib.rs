//! Admission control for scarce runner resources.
//!
//! Each runner has one semaphore instance: a task owning a durable queue of
//! tickets (see [`machine`]). A ticket that needs several runners is enqueued
//! on each of them by the [`TicketCoordinator`]; the ticket's leader runner
//! starts the pipeline run once every required runner granted it a slot and
//! tells the other runners which run holds their slot.

mod actor;
pub mod aggregate;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod machine;
pub mod store;

pub use actor::{LauncherSlot, RunLauncher, SemaphoreHandle, SignalRouter};
pub use aggregate::aggregate_runner_statuses;
pub use coordinator::{TicketCoordinator, normalize_ticket};
pub use error::AdmissionError;
pub use hub::{HubRegistry, SemaphoreClient, SemaphoreHub, StoreFactory};
pub use machine::{Effect, SemaphoreMachine, Signal};
pub use store::{FileSemaphoreStore, MemorySemaphoreStore, SemaphoreStore};

/// Prefix of every semaphore instance id.
pub const SEMAPHORE_ID_PREFIX: &str = "runner-semaphore/";

/// Deterministic instance id for a runner's semaphore.
///
/// ```
/// assert_eq!(runlane_admission::semaphore_instance_id(" pixel-8 "), "runner-semaphore/pixel-8");
/// ```
pub fn semaphore_instance_id(runner_id: &str) -> String {
    format!("{SEMAPHORE_ID_PREFIX}{}", runner_id.trim())
}
