//! Remote authoritative store interface.
//!
//! The sync engine only ever talks to the remote through [`RemoteStore`].
//! Failures are classified up front so the drain loop can decide between
//! retrying, dropping, or running conflict resolution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{CollectionPath, OperationType, Payload, QueuedOperation};

/// Classified remote failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, or server-side hiccup. Worth retrying.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Rejected by authorization rules, e.g. stale membership arrays.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Rejected by server-side validation.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Target is missing (`None`) or was modified concurrently at the given time.
    #[error("Conflict (server modified at {server_modified_at:?})")]
    Conflict {
        server_modified_at: Option<DateTime<Utc>>,
    },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient(message.into())
    }

    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Address of one remote document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub collection: CollectionPath,
    pub document_id: String,
}

impl DocumentRef {
    pub fn new(collection: CollectionPath, document_id: impl Into<String>) -> Self {
        Self {
            collection,
            document_id: document_id.into(),
        }
    }

    pub fn of(op: &QueuedOperation) -> Self {
        Self::new(op.collection.clone(), op.document_id.clone())
    }
}

/// A document as returned by a live query
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub payload: Payload,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Full result set of a live query at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub collection: CollectionPath,
    pub owner_id: String,
    pub documents: Vec<RemoteDocument>,
}

/// Remote system of record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError>;

    async fn update(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError>;

    async fn delete(&self, target: &DocumentRef) -> Result<(), RemoteError>;

    /// Unconditional write, or unconditional delete when `payload` is `None`.
    /// Used to apply a last-write-wins resolution.
    async fn overwrite(
        &self,
        target: &DocumentRef,
        payload: Option<&Payload>,
    ) -> Result<(), RemoteError>;

    /// Open a live query over one owner's collection
    async fn subscribe(
        &self,
        collection: &CollectionPath,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<RemoteSnapshot>, RemoteError>;
}

/// Dispatch a queued operation to the matching remote write.
pub async fn apply_operation(
    remote: &dyn RemoteStore,
    op: &QueuedOperation,
) -> Result<(), RemoteError> {
    let target = DocumentRef::of(op);
    match (op.op_type, op.payload.as_ref()) {
        (OperationType::Create, Some(payload)) => remote.create(&target, payload).await,
        (OperationType::Update, Some(payload)) => remote.update(&target, payload).await,
        (OperationType::Delete, _) => remote.delete(&target).await,
        (_, None) => Err(RemoteError::Rejected(format!(
            "{} operation {} has no payload",
            op.op_type.as_str(),
            op.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RemoteError::transient("timeout").is_retryable());
        assert!(!RemoteError::Unauthorized("stale".into()).is_retryable());
        assert!(!RemoteError::Rejected("bad".into()).is_retryable());
        assert!(!RemoteError::Conflict {
            server_modified_at: None
        }
        .is_retryable());
    }
}
