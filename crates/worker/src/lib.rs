//! Worker side of the kiln task framework, plus the types and wire protocol shared with the
//! manager.
//!
//! The shared pieces ([bundle], [fingerprint], [protocol], [resources], [stats]) are always
//! available. The worker runtime itself is behind the `worker-side` feature.

pub mod bundle;
pub mod fingerprint;
pub mod protocol;
pub mod resources;
pub mod stats;

#[cfg(feature = "worker-side")]
pub mod cache;
#[cfg(feature = "worker-side")]
pub mod error;
#[cfg(feature = "worker-side")]
pub mod executor;
#[cfg(feature = "worker-side")]
pub mod sandbox;
#[cfg(feature = "worker-side")]
mod worker;

pub use bundle::{Bundle, Entry, EntryKind};
pub use fingerprint::{ArtifactKind, CachedArtifact, Fingerprint};
pub use protocol::{TaskId, WorkerId};
pub use resources::Resources;
pub use stats::Statistics;

#[cfg(feature = "worker-side")]
pub use error::WorkerError;
#[cfg(feature = "worker-side")]
pub use worker::{Worker, WorkerConfig};
