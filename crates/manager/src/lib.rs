//! The manager side of kiln: declare artifacts, submit shell tasks, and collect their results
//! while remote workers connect over TCP to run them.
//!
//! A [Manager] owns the artifact store, the registry of connected workers, and the task queue.
//! Tasks are dispatched to whichever worker has room, preferring workers that already cache the
//! task's inputs, and each finished task comes back exactly once from [Manager::wait].

mod artifact;
mod config;
mod error;
mod manager;
mod monitor;
mod registry;
mod scheduler;
mod server;
mod state;
mod task;
#[cfg(test)]
mod test_util;

pub use artifact::ArtifactHandle;
pub use config::{EvictionPolicy, ManagerConfig, DEFAULT_PORT};
pub use error::{DeclarationError, ManagerError, TransferError};
pub use kiln_worker::{Resources, Statistics, TaskId, WorkerId};
pub use manager::{Manager, ManagerStats};
pub use task::{CompletedTask, InputBinding, OutputBinding, Task, TaskResult};
