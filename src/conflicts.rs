//! Conflict resolution for MedSync.
//!
//! This module handles:
//! - Deciding conflicts with server-timestamp last-write-wins
//! - Recording the conflicts that rule cannot settle
//! - Listing and resolving recorded conflicts (keep local or keep remote)

use chrono::{DateTime, Utc};

use crate::database::Database;
use crate::error::{MedSyncError, MedSyncResult};
use crate::models::{
    generate_operation_id, CollectionPath, OperationRequest, OperationType, Payload, Priority,
    QueuedOperation,
};

/// Outcome of applying last-write-wins to a remote conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Target vanished remotely; write it back under the same id
    Recreate,
    /// Delete of a target that is already gone
    AlreadyDeleted,
    /// Local operation is newer than the server copy; force it through
    ClientWins,
    /// Server copy is newer; the local payload needs a human decision
    ServerNewer,
}

impl ConflictDecision {
    /// Whether the decision requires a forced remote write
    pub fn needs_overwrite(&self) -> bool {
        matches!(self, ConflictDecision::Recreate | ConflictDecision::ClientWins)
    }
}

/// Decide a conflict using the server timestamp.
///
/// The local side wins only when strictly newer; ties go to the server.
pub fn decide_conflict(
    op_type: OperationType,
    local_timestamp: DateTime<Utc>,
    server_modified_at: Option<DateTime<Utc>>,
) -> ConflictDecision {
    match server_modified_at {
        None if op_type == OperationType::Delete => ConflictDecision::AlreadyDeleted,
        None => ConflictDecision::Recreate,
        Some(server) if local_timestamp > server => ConflictDecision::ClientWins,
        Some(_) => ConflictDecision::ServerNewer,
    }
}

/// How to resolve a recorded conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionChoice {
    KeepLocal,
    KeepRemote,
}

impl ResolutionChoice {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "keep_local" | "local" => Some(ResolutionChoice::KeepLocal),
            "keep_remote" | "remote" => Some(ResolutionChoice::KeepRemote),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::KeepLocal => "keep_local",
            ResolutionChoice::KeepRemote => "keep_remote",
        }
    }
}

/// A conflict waiting for the domain layer to reconcile it
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: String,
    pub operation_id: String,
    pub op_type: OperationType,
    pub collection: CollectionPath,
    pub document_id: String,
    /// The local payload, kept so no user data is lost
    pub payload: Option<Payload>,
    pub local_timestamp: DateTime<Utc>,
    pub server_modified_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ResolutionChoice>,
}

impl ConflictRecord {
    /// Capture a losing operation as an unresolved conflict
    pub fn from_operation(op: &QueuedOperation, server_modified_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: generate_operation_id(),
            operation_id: op.id.clone(),
            op_type: op.op_type,
            collection: op.collection.clone(),
            document_id: op.document_id.clone(),
            payload: op.payload.clone(),
            local_timestamp: op.timestamp,
            server_modified_at,
            priority: op.priority,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Rebuild the mutation intent to replay when the local side is kept
    pub fn to_request(&self) -> OperationRequest {
        OperationRequest {
            op_type: self.op_type,
            collection: self.collection.clone(),
            document_id: self.document_id.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
        }
    }
}

/// Conflict manager
pub struct ConflictManager<'a> {
    db: &'a Database,
}

impl<'a> ConflictManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get count of unresolved conflicts
    pub fn get_unresolved_count(&self) -> MedSyncResult<i64> {
        self.db.count_unresolved_conflicts()
    }

    /// Get conflicts, newest first
    pub fn get_conflicts(&self, include_resolved: bool) -> MedSyncResult<Vec<ConflictRecord>> {
        self.db.get_conflicts(include_resolved)
    }

    /// Find an unresolved conflict by ID or unique ID prefix
    pub fn find_unresolved(&self, conflict_id_prefix: &str) -> MedSyncResult<ConflictRecord> {
        let mut matches: Vec<ConflictRecord> = self
            .get_conflicts(false)?
            .into_iter()
            .filter(|c| c.id.starts_with(conflict_id_prefix))
            .collect();

        match matches.len() {
            0 => Err(MedSyncError::NotFound(format!(
                "Conflict with ID starting with '{}' not found",
                conflict_id_prefix
            ))),
            1 => Ok(matches.remove(0)),
            _ => Err(MedSyncError::validation(
                "conflict_id",
                format!("ambiguous conflict prefix '{}'", conflict_id_prefix),
            )),
        }
    }

    /// Mark a conflict resolved.
    ///
    /// Returns the record so the caller can replay it when the local side was kept.
    pub fn resolve(
        &self,
        conflict_id_prefix: &str,
        choice: ResolutionChoice,
    ) -> MedSyncResult<ConflictRecord> {
        let mut record = self.find_unresolved(conflict_id_prefix)?;
        if !self.db.mark_conflict_resolved(&record.id, choice)? {
            return Err(MedSyncError::Conflict(format!(
                "conflict {} was resolved concurrently",
                record.id
            )));
        }
        record.resolved_at = Some(Utc::now());
        record.resolution = Some(choice);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use chrono::Duration;

    fn sample_op() -> QueuedOperation {
        let collection = CollectionPath::for_owner("u1", EntityKind::DoseLog).unwrap();
        let payload =
            Payload::encode(EntityKind::DoseLog, &serde_json::json!({"taken": true})).unwrap();
        OperationRequest::update(collection, "log-1", payload)
            .with_priority(Priority::Critical)
            .into_operation(3, 0)
            .unwrap()
    }

    #[test]
    fn test_decide_missing_target() {
        let now = Utc::now();
        assert_eq!(
            decide_conflict(OperationType::Update, now, None),
            ConflictDecision::Recreate
        );
        assert_eq!(
            decide_conflict(OperationType::Delete, now, None),
            ConflictDecision::AlreadyDeleted
        );
    }

    #[test]
    fn test_decide_last_write_wins() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(5);
        assert_eq!(
            decide_conflict(OperationType::Update, now, Some(earlier)),
            ConflictDecision::ClientWins
        );
        assert_eq!(
            decide_conflict(OperationType::Update, earlier, Some(now)),
            ConflictDecision::ServerNewer
        );
        // Ties go to the server
        assert_eq!(
            decide_conflict(OperationType::Update, now, Some(now)),
            ConflictDecision::ServerNewer
        );
    }

    #[test]
    fn test_record_and_resolve() {
        let db = Database::new_in_memory().unwrap();
        let op = sample_op();
        let record = ConflictRecord::from_operation(&op, Some(Utc::now()));
        db.record_conflict(&record).unwrap();

        let manager = ConflictManager::new(&db);
        assert_eq!(manager.get_unresolved_count().unwrap(), 1);

        let listed = manager.get_conflicts(false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].payload, op.payload);
        assert_eq!(listed[0].priority, Priority::Critical);

        let resolved = manager.resolve(&record.id[..12], ResolutionChoice::KeepLocal).unwrap();
        assert_eq!(resolved.resolution, Some(ResolutionChoice::KeepLocal));
        assert_eq!(manager.get_unresolved_count().unwrap(), 0);

        let all = manager.get_conflicts(true).unwrap();
        assert!(all[0].is_resolved());
        assert_eq!(all[0].resolution, Some(ResolutionChoice::KeepLocal));
    }

    #[test]
    fn test_resolve_unknown_conflict() {
        let db = Database::new_in_memory().unwrap();
        let manager = ConflictManager::new(&db);
        let result = manager.resolve("deadbeef", ResolutionChoice::KeepRemote);
        assert!(matches!(result, Err(MedSyncError::NotFound(_))));
    }

    #[test]
    fn test_to_request_replays_payload() {
        let op = sample_op();
        let record = ConflictRecord::from_operation(&op, None);
        let request = record.to_request();
        assert_eq!(request.op_type, OperationType::Update);
        assert_eq!(request.document_id, "log-1");
        assert_eq!(request.payload, op.payload);
    }

    #[test]
    fn test_resolution_choice_parsing() {
        assert_eq!(ResolutionChoice::from_str("local"), Some(ResolutionChoice::KeepLocal));
        assert_eq!(ResolutionChoice::from_str("KEEP_REMOTE"), Some(ResolutionChoice::KeepRemote));
        assert_eq!(ResolutionChoice::from_str("merge"), None);
    }
}
