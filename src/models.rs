//! Data models for MedSync.
//!
//! This module defines the queued mutation intent (`QueuedOperation`), the
//! opaque payload that travels with it, cached entity rows, and the aggregate
//! sync counters published to the UI.
//! Operation IDs are UUID7 hex strings, so they sort by creation time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MedSyncError, MedSyncResult};
use crate::validation::{
    validate_collection_path, validate_document_id, validate_payload_size, validate_user_id,
};

/// Kind of mutation carried by a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// Drain priority band.
///
/// Ordering follows drain order: `Critical > High > Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    /// Clinical dose events (taken/missed)
    Critical,
}

impl Priority {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Domain entity kinds the queue carries payloads for.
///
/// The queue never looks inside a payload; the kind only tells the domain
/// layer which deserializer to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Medication,
    DoseLog,
    Patient,
    CareNetwork,
    Telemetry,
}

impl EntityKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "medication" | "medications" => Some(EntityKind::Medication),
            "dose_log" | "logs" => Some(EntityKind::DoseLog),
            "patient" | "patients" => Some(EntityKind::Patient),
            "care_network" | "care-network" => Some(EntityKind::CareNetwork),
            "telemetry" | "views" => Some(EntityKind::Telemetry),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Medication => "medication",
            EntityKind::DoseLog => "dose_log",
            EntityKind::Patient => "patient",
            EntityKind::CareNetwork => "care_network",
            EntityKind::Telemetry => "telemetry",
        }
    }

    /// Collection name used under a user's subtree
    pub fn collection_name(&self) -> &'static str {
        match self {
            EntityKind::Medication => "medications",
            EntityKind::DoseLog => "logs",
            EntityKind::Patient => "patients",
            EntityKind::CareNetwork => "care-network",
            EntityKind::Telemetry => "views",
        }
    }
}

/// Opaque entity payload: serialized JSON bytes tagged with their entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: EntityKind,
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Serialize a domain value into a payload
    pub fn encode<T: Serialize>(kind: EntityKind, value: &T) -> MedSyncResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        validate_payload_size(&bytes)?;
        Ok(Self { kind, bytes })
    }

    /// Wrap already-serialized bytes
    pub fn from_bytes(kind: EntityKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    /// Deserialize the payload into a domain value
    pub fn decode<T: DeserializeOwned>(&self) -> MedSyncResult<T> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

/// Logical target collection, e.g. `users/{uid}/medications`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> MedSyncResult<Self> {
        let path = path.into();
        validate_collection_path(&path)?;
        Ok(Self(path))
    }

    /// Build the per-user collection path for an entity kind
    pub fn for_owner(owner_id: &str, kind: EntityKind) -> MedSyncResult<Self> {
        validate_user_id(owner_id)?;
        Self::new(format!("users/{}/{}", owner_id, kind.collection_name()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning user id, when the path is parameterized by one
    pub fn owner_id(&self) -> Option<&str> {
        let mut segments = self.0.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some("users"), Some(owner), Some(_)) => Some(owner),
            _ => None,
        }
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pending mutation intent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    /// UUID7 hex, generated at enqueue time
    pub id: String,
    pub op_type: OperationType,
    pub collection: CollectionPath,
    /// Target entity id (client-generated for creates)
    pub document_id: String,
    /// Absent for deletes
    pub payload: Option<Payload>,
    /// Creation time; used for ordering and last-write-wins
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub owner_id: Option<String>,
    /// Enqueue sequence number, FIFO tiebreak inside a band
    pub seq: u64,
    /// Set when durable persistence failed and the operation lives in memory only
    pub degraded: bool,
}

impl QueuedOperation {
    /// Whether another transient failure would still be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A mutation intent as submitted by a domain service.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub op_type: OperationType,
    pub collection: CollectionPath,
    pub document_id: String,
    pub payload: Option<Payload>,
    pub priority: Priority,
}

impl OperationRequest {
    pub fn create(
        collection: CollectionPath,
        document_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            op_type: OperationType::Create,
            collection,
            document_id: document_id.into(),
            payload: Some(payload),
            priority: Priority::Normal,
        }
    }

    pub fn update(
        collection: CollectionPath,
        document_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            op_type: OperationType::Update,
            collection,
            document_id: document_id.into(),
            payload: Some(payload),
            priority: Priority::Normal,
        }
    }

    pub fn delete(collection: CollectionPath, document_id: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Delete,
            collection,
            document_id: document_id.into(),
            payload: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Validate the request and stamp it into a queued operation
    pub fn into_operation(self, max_retries: u32, seq: u64) -> MedSyncResult<QueuedOperation> {
        validate_document_id(&self.document_id)?;
        match (self.op_type, &self.payload) {
            (OperationType::Delete, Some(_)) => {
                return Err(MedSyncError::validation(
                    "payload",
                    "delete operations carry no payload",
                ));
            }
            (OperationType::Create | OperationType::Update, None) => {
                return Err(MedSyncError::validation(
                    "payload",
                    format!("{} operations require a payload", self.op_type.as_str()),
                ));
            }
            _ => {}
        }

        let owner_id = self.collection.owner_id().map(String::from);
        Ok(QueuedOperation {
            id: generate_operation_id(),
            op_type: self.op_type,
            collection: self.collection,
            document_id: self.document_id,
            payload: self.payload,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries,
            priority: self.priority,
            owner_id,
            seq,
            degraded: false,
        })
    }
}

/// Generate a new operation ID (UUID7 hex)
pub fn generate_operation_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// A row in the local entity cache
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub collection: CollectionPath,
    pub id: String,
    pub owner_id: Option<String>,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
}

impl CachedEntity {
    pub fn new(collection: CollectionPath, id: impl Into<String>, payload: Payload) -> Self {
        let owner_id = collection.owner_id().map(String::from);
        Self {
            collection,
            id: id.into(),
            owner_id,
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregate sync counters, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStats {
    pub pending_operations: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub resolved_conflicts: u64,
    pub unresolved_conflicts: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncStats {
    /// Operations that reached a terminal outcome
    pub fn processed(&self) -> u64 {
        self.successful_syncs + self.failed_syncs
    }
}

/// Process-wide sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not actively draining
    Idle,
    /// A drain is in progress
    Syncing,
    /// Queue empty and the last attempt succeeded
    Synced,
    /// Last attempt failed and operations remain queued
    Error,
}

/// Colour-coded severity for progress display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Danger,
}

/// Aggregate counts for a progress indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub pending: u64,
    pub processed: u64,
    pub severity: Severity,
}

impl SyncProgress {
    pub fn from_stats(stats: &SyncStats) -> Self {
        let pending = stats.pending_operations;
        let processed = stats.processed();
        let severity = if pending == 0 {
            Severity::Success
        } else if processed >= pending {
            Severity::Warning
        } else {
            Severity::Danger
        };
        Self {
            pending,
            processed,
            severity,
        }
    }
}
