//! MedSync - offline-first synchronization core for the medication tracker.
//!
//! This library provides:
//! - A durable, priority-ordered operation queue with delete coalescing
//! - A single-flight sync engine with retry, backoff and conflict handling
//! - A permission gate that holds live queries until membership arrays are current
//! - Local cache reconciliation from live-query snapshots
//! - Connectivity signals and aggregate sync stats
//!
//! Domain services talk to a running engine through a [`SyncHandle`]; the UI
//! observes it through `watch` receivers.
//!
//! # Feature Flags
//!
//! - `desktop`: Default config dir detection. Without it a config dir must be passed in.

pub mod config;
pub mod conflicts;
pub mod connectivity;
pub mod database;
pub mod engine;
pub mod error;
pub mod http_remote;
pub mod models;
pub mod permissions;
pub mod queue;
pub mod remote;
pub mod session;
pub mod stats;
pub mod validation;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use database::{Database, SharedDatabase};
pub use engine::{EngineSettings, OperationOutcome, SyncEngine, SyncEvent, SyncHandle};
pub use error::{MedSyncError, MedSyncResult};
pub use models::{
    CollectionPath, EntityKind, OperationRequest, OperationType, Payload, Priority,
    QueuedOperation, SyncProgress, SyncStats, SyncStatus,
};
pub use permissions::{PermissionGate, PermissionState};
pub use remote::{RemoteError, RemoteStore};
pub use session::SessionCoordinator;
