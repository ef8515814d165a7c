//! Durable local store for MedSync.
//!
//! This module provides all local persistence using SQLite:
//! - the entity cache UI code reads from (keyed by collection and id, with a
//!   secondary index on the owning user)
//! - the durable operation queue
//! - a small key/value table for persisted state such as sync stats
//! - conflict records awaiting manual reconciliation
//!
//! All timestamps are Unix milliseconds (INTEGER). Last-write-wins comparisons
//! need sub-second precision.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::conflicts::{ConflictRecord, ResolutionChoice};
use crate::error::{MedSyncError, MedSyncResult};
use crate::models::{
    CachedEntity, CollectionPath, EntityKind, OperationType, Payload, Priority, QueuedOperation,
};
use crate::validation::{validate_document_id, validate_index_name};

/// Secondary indexes supported by [`Database::get_by_index`]
pub const INDEX_OWNER_ID: &str = "owner_id";
pub const INDEX_KIND: &str = "kind";

const ENTITY_COLUMNS: &str = "collection, id, owner_id, kind, data, updated_at";

const OPERATION_COLUMNS: &str = "id, seq, op_type, collection, document_id, payload_kind, \
     payload, created_at, retry_count, max_retries, priority, owner_id";

const CONFLICT_COLUMNS: &str = "id, operation_id, op_type, collection, document_id, payload_kind, \
     payload, local_timestamp, server_modified_at, priority, created_at, resolved_at, resolution";

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn conversion_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    let message: String = message.into();
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn parse_collection(column: usize, value: String) -> rusqlite::Result<CollectionPath> {
    CollectionPath::new(value).map_err(|e| conversion_error(column, e.to_string()))
}

fn parse_kind(column: usize, value: &str) -> rusqlite::Result<EntityKind> {
    EntityKind::from_str(value)
        .ok_or_else(|| conversion_error(column, format!("unknown entity kind '{}'", value)))
}

fn parse_payload(
    kind_column: usize,
    kind: Option<String>,
    bytes: Option<Vec<u8>>,
) -> rusqlite::Result<Option<Payload>> {
    match (kind, bytes) {
        (Some(kind), Some(bytes)) => {
            let kind = parse_kind(kind_column, &kind)?;
            Ok(Some(Payload::from_bytes(kind, bytes)))
        }
        _ => Ok(None),
    }
}

/// Store shared between the sync engine and UI readers
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Lock a shared store, mapping poisoning to a database error
pub fn lock_db(db: &Mutex<Database>) -> MedSyncResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|e| MedSyncError::database_op(format!("database lock poisoned: {}", e)))
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> MedSyncResult<Self> {
        let conn = Connection::open(db_path)?;

        // WAL lets UI readers run alongside the queue writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> MedSyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> MedSyncResult<()> {
        self.conn.execute_batch(
            r#"
            -- Local entity cache, one row per (collection, id)
            CREATE TABLE IF NOT EXISTS entities (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                owner_id TEXT,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(collection, owner_id);
            CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(collection, kind);

            -- Durable operation queue; seq preserves enqueue order across restarts
            CREATE TABLE IF NOT EXISTS operation_queue (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                op_type TEXT NOT NULL,
                collection TEXT NOT NULL,
                document_id TEXT NOT NULL,
                payload_kind TEXT,
                payload BLOB,
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                priority TEXT NOT NULL,
                owner_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_document ON operation_queue(collection, document_id);
            CREATE INDEX IF NOT EXISTS idx_queue_owner ON operation_queue(owner_id);

            -- Small persisted records (sync stats and the like)
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Conflicts that last-write-wins could not settle
            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                operation_id TEXT NOT NULL,
                op_type TEXT NOT NULL,
                collection TEXT NOT NULL,
                document_id TEXT NOT NULL,
                payload_kind TEXT,
                payload BLOB,
                local_timestamp INTEGER NOT NULL,
                server_modified_at INTEGER,
                priority TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                resolution TEXT
            );
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ============================================================================
    // Entity cache
    // ============================================================================

    fn row_to_entity(row: &Row) -> rusqlite::Result<CachedEntity> {
        let collection = parse_collection(0, row.get(0)?)?;
        let kind: String = row.get(3)?;
        Ok(CachedEntity {
            collection,
            id: row.get(1)?,
            owner_id: row.get(2)?,
            payload: Payload::from_bytes(parse_kind(3, &kind)?, row.get(4)?),
            updated_at: millis_to_datetime(row.get(5)?),
        })
    }

    /// Get a cached entity by collection and id
    pub fn get(
        &self,
        collection: &CollectionPath,
        id: &str,
    ) -> MedSyncResult<Option<CachedEntity>> {
        let entity = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM entities WHERE collection = ? AND id = ?",
                    ENTITY_COLUMNS
                ),
                params![collection.as_str(), id],
                Self::row_to_entity,
            )
            .optional()?;
        Ok(entity)
    }

    /// Insert or replace a cached entity
    pub fn put(&self, entity: &CachedEntity) -> MedSyncResult<()> {
        validate_document_id(&entity.id)?;
        self.conn.execute(
            r#"
            INSERT INTO entities (collection, id, owner_id, kind, data, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                owner_id = excluded.owner_id,
                kind = excluded.kind,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
            params![
                entity.collection.as_str(),
                entity.id,
                entity.owner_id,
                entity.payload.kind.as_str(),
                entity.payload.bytes,
                entity.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace many entities of one collection in a single transaction
    pub fn put_batch(
        &self,
        collection: &CollectionPath,
        entities: &[CachedEntity],
    ) -> MedSyncResult<usize> {
        if let Some(stray) = entities.iter().find(|e| &e.collection != collection) {
            return Err(MedSyncError::validation(
                "collection",
                format!("entity {} belongs to {}, not {}", stray.id, stray.collection, collection),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;
        for entity in entities {
            self.put(entity)?;
        }
        tx.commit()?;
        Ok(entities.len())
    }

    /// Delete a cached entity. Returns whether a row was removed.
    pub fn delete(&self, collection: &CollectionPath, id: &str) -> MedSyncResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM entities WHERE collection = ? AND id = ?",
            params![collection.as_str(), id],
        )?;
        Ok(removed > 0)
    }

    /// Look up cached entities by a secondary index
    pub fn get_by_index(
        &self,
        collection: &CollectionPath,
        index_name: &str,
        value: &str,
    ) -> MedSyncResult<Vec<CachedEntity>> {
        validate_index_name(index_name)?;
        let column = match index_name {
            INDEX_OWNER_ID => "owner_id",
            INDEX_KIND => "kind",
            other => {
                return Err(MedSyncError::validation(
                    "index_name",
                    format!("no index named '{}'", other),
                ))
            }
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entities WHERE collection = ? AND {} = ? ORDER BY id",
            ENTITY_COLUMNS, column
        ))?;
        let entities = stmt
            .query_map(params![collection.as_str(), value], Self::row_to_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// All cached entities in a collection
    pub fn list_collection(&self, collection: &CollectionPath) -> MedSyncResult<Vec<CachedEntity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entities WHERE collection = ? ORDER BY id",
            ENTITY_COLUMNS
        ))?;
        let entities = stmt
            .query_map([collection.as_str()], Self::row_to_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    // ============================================================================
    // Operation queue
    // ============================================================================

    fn row_to_operation(row: &Row) -> rusqlite::Result<QueuedOperation> {
        let op_type: String = row.get(2)?;
        let priority: String = row.get(10)?;
        let seq: i64 = row.get(1)?;
        let retry_count: i64 = row.get(8)?;
        let max_retries: i64 = row.get(9)?;

        Ok(QueuedOperation {
            id: row.get(0)?,
            seq: seq as u64,
            op_type: OperationType::from_str(&op_type).ok_or_else(|| {
                conversion_error(2, format!("unknown operation type '{}'", op_type))
            })?,
            collection: parse_collection(3, row.get(3)?)?,
            document_id: row.get(4)?,
            payload: parse_payload(5, row.get(5)?, row.get(6)?)?,
            timestamp: millis_to_datetime(row.get(7)?),
            retry_count: retry_count as u32,
            max_retries: max_retries as u32,
            priority: Priority::from_str(&priority)
                .ok_or_else(|| conversion_error(10, format!("unknown priority '{}'", priority)))?,
            owner_id: row.get(11)?,
            degraded: false,
        })
    }

    /// Persist a queued operation
    pub fn persist_operation(&self, op: &QueuedOperation) -> MedSyncResult<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO operation_queue ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                OPERATION_COLUMNS
            ),
            params![
                op.id,
                op.seq as i64,
                op.op_type.as_str(),
                op.collection.as_str(),
                op.document_id,
                op.payload.as_ref().map(|p| p.kind.as_str()),
                op.payload.as_ref().map(|p| p.bytes.as_slice()),
                op.timestamp.timestamp_millis(),
                op.retry_count as i64,
                op.max_retries as i64,
                op.priority.as_str(),
                op.owner_id,
            ],
        )?;
        Ok(())
    }

    /// Remove one queued operation. Returns whether it existed.
    pub fn remove_operation(&self, op_id: &str) -> MedSyncResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM operation_queue WHERE id = ?", [op_id])?;
        Ok(removed > 0)
    }

    /// Remove every queued operation targeting a document. Returns the count.
    pub fn remove_pending_for_document(
        &self,
        collection: &CollectionPath,
        document_id: &str,
    ) -> MedSyncResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM operation_queue WHERE collection = ? AND document_id = ?",
            params![collection.as_str(), document_id],
        )?;
        Ok(removed)
    }

    /// Remove every queued operation owned by a user. Returns the count.
    pub fn remove_operations_for_owner(&self, owner_id: &str) -> MedSyncResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM operation_queue WHERE owner_id = ?", [owner_id])?;
        Ok(removed)
    }

    /// Record a new attempt count for a queued operation
    pub fn update_retry_count(&self, op_id: &str, retry_count: u32) -> MedSyncResult<bool> {
        let updated = self.conn.execute(
            "UPDATE operation_queue SET retry_count = ? WHERE id = ?",
            params![retry_count as i64, op_id],
        )?;
        Ok(updated > 0)
    }

    /// Load all persisted operations in enqueue order.
    ///
    /// Rows that no longer decode are skipped and left in place.
    pub fn load_operations(&self) -> MedSyncResult<Vec<QueuedOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM operation_queue ORDER BY seq ASC, id ASC",
            OPERATION_COLUMNS
        ))?;
        let mut ops = Vec::new();
        for row in stmt.query_map([], Self::row_to_operation)? {
            match row {
                Ok(op) => ops.push(op),
                Err(
                    e @ (rusqlite::Error::FromSqlConversionFailure(..)
                    | rusqlite::Error::InvalidColumnType(..)),
                ) => {
                    warn!(error = %e, "Skipping unreadable queued operation");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ops)
    }

    // ============================================================================
    // Key/value
    // ============================================================================

    /// Read a persisted value
    pub fn get_meta(&self, key: &str) -> MedSyncResult<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv_store WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Write a persisted value
    pub fn put_meta(&self, key: &str, value: &str) -> MedSyncResult<()> {
        self.conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ============================================================================
    // Conflicts
    // ============================================================================

    fn row_to_conflict(row: &Row) -> rusqlite::Result<ConflictRecord> {
        let op_type: String = row.get(2)?;
        let priority: String = row.get(9)?;
        let server_modified_at: Option<i64> = row.get(8)?;
        let resolved_at: Option<i64> = row.get(11)?;
        let resolution: Option<String> = row.get(12)?;

        Ok(ConflictRecord {
            id: row.get(0)?,
            operation_id: row.get(1)?,
            op_type: OperationType::from_str(&op_type).ok_or_else(|| {
                conversion_error(2, format!("unknown operation type '{}'", op_type))
            })?,
            collection: parse_collection(3, row.get(3)?)?,
            document_id: row.get(4)?,
            payload: parse_payload(5, row.get(5)?, row.get(6)?)?,
            local_timestamp: millis_to_datetime(row.get(7)?),
            server_modified_at: server_modified_at.map(millis_to_datetime),
            priority: Priority::from_str(&priority)
                .ok_or_else(|| conversion_error(9, format!("unknown priority '{}'", priority)))?,
            created_at: millis_to_datetime(row.get(10)?),
            resolved_at: resolved_at.map(millis_to_datetime),
            resolution: resolution.as_deref().and_then(ResolutionChoice::from_str),
        })
    }

    /// Store an unresolved conflict
    pub fn record_conflict(&self, record: &ConflictRecord) -> MedSyncResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO sync_conflicts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                CONFLICT_COLUMNS
            ),
            params![
                record.id,
                record.operation_id,
                record.op_type.as_str(),
                record.collection.as_str(),
                record.document_id,
                record.payload.as_ref().map(|p| p.kind.as_str()),
                record.payload.as_ref().map(|p| p.bytes.as_slice()),
                record.local_timestamp.timestamp_millis(),
                record.server_modified_at.map(|t| t.timestamp_millis()),
                record.priority.as_str(),
                record.created_at.timestamp_millis(),
                record.resolved_at.map(|t| t.timestamp_millis()),
                record.resolution.map(|r| r.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Get a conflict by ID
    pub fn get_conflict(&self, conflict_id: &str) -> MedSyncResult<Option<ConflictRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sync_conflicts WHERE id = ?", CONFLICT_COLUMNS),
                [conflict_id],
                Self::row_to_conflict,
            )
            .optional()?;
        Ok(record)
    }

    /// List conflicts, newest first
    pub fn get_conflicts(&self, include_resolved: bool) -> MedSyncResult<Vec<ConflictRecord>> {
        let query = if include_resolved {
            format!(
                "SELECT {} FROM sync_conflicts ORDER BY created_at DESC",
                CONFLICT_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY created_at DESC",
                CONFLICT_COLUMNS
            )
        };

        let mut stmt = self.conn.prepare(&query)?;
        let records = stmt
            .query_map([], Self::row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Mark a conflict resolved. Returns false if it was unknown or already resolved.
    pub fn mark_conflict_resolved(
        &self,
        conflict_id: &str,
        resolution: ResolutionChoice,
    ) -> MedSyncResult<bool> {
        let updated = self.conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?, resolution = ? \
             WHERE id = ? AND resolved_at IS NULL",
            params![Utc::now().timestamp_millis(), resolution.as_str(), conflict_id],
        )?;
        Ok(updated > 0)
    }

    /// Count conflicts awaiting manual reconciliation
    pub fn count_unresolved_conflicts(&self) -> MedSyncResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationRequest;

    fn meds(owner: &str) -> CollectionPath {
        CollectionPath::for_owner(owner, EntityKind::Medication).unwrap()
    }

    fn med_payload(name: &str) -> Payload {
        Payload::encode(EntityKind::Medication, &serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn test_put_and_get_entity() {
        let db = Database::new_in_memory().unwrap();
        let entity = CachedEntity::new(meds("u1"), "med-1", med_payload("Aspirin"));
        db.put(&entity).unwrap();

        let loaded = db.get(&meds("u1"), "med-1").unwrap().unwrap();
        assert_eq!(loaded.owner_id.as_deref(), Some("u1"));
        assert_eq!(loaded.payload, entity.payload);
        assert!(db.get(&meds("u1"), "missing").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_existing() {
        let db = Database::new_in_memory().unwrap();
        db.put(&CachedEntity::new(meds("u1"), "med-1", med_payload("Old"))).unwrap();
        db.put(&CachedEntity::new(meds("u1"), "med-1", med_payload("New"))).unwrap();

        let all = db.list_collection(&meds("u1")).unwrap();
        assert_eq!(all.len(), 1);
        let value: serde_json::Value = all[0].payload.decode().unwrap();
        assert_eq!(value["name"], "New");
    }

    #[test]
    fn test_put_batch_and_delete() {
        let db = Database::new_in_memory().unwrap();
        let entities: Vec<_> = (0..3)
            .map(|i| CachedEntity::new(meds("u1"), format!("med-{}", i), med_payload("x")))
            .collect();
        assert_eq!(db.put_batch(&meds("u1"), &entities).unwrap(), 3);

        assert!(db.delete(&meds("u1"), "med-1").unwrap());
        assert!(!db.delete(&meds("u1"), "med-1").unwrap());
        assert_eq!(db.list_collection(&meds("u1")).unwrap().len(), 2);
    }

    #[test]
    fn test_put_batch_rejects_foreign_collection() {
        let db = Database::new_in_memory().unwrap();
        let entities = vec![CachedEntity::new(meds("u2"), "med-1", med_payload("x"))];
        assert!(db.put_batch(&meds("u1"), &entities).is_err());
    }

    #[test]
    fn test_get_by_owner_index() {
        let db = Database::new_in_memory().unwrap();
        let shared = CollectionPath::new("prescriptions").unwrap();
        let mut a = CachedEntity::new(shared.clone(), "p-1", med_payload("a"));
        a.owner_id = Some("u1".into());
        let mut b = CachedEntity::new(shared.clone(), "p-2", med_payload("b"));
        b.owner_id = Some("u2".into());
        db.put_batch(&shared, &[a, b]).unwrap();

        let owned = db.get_by_index(&shared, INDEX_OWNER_ID, "u1").unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, "p-1");

        let by_kind = db.get_by_index(&shared, INDEX_KIND, "medication").unwrap();
        assert_eq!(by_kind.len(), 2);

        assert!(db.get_by_index(&shared, "content", "x").is_err());
    }

    #[test]
    fn test_operation_persistence_roundtrip() {
        let db = Database::new_in_memory().unwrap();
        let op = OperationRequest::update(meds("u1"), "med-1", med_payload("x"))
            .with_priority(Priority::Critical)
            .into_operation(3, 4)
            .unwrap();
        db.persist_operation(&op).unwrap();

        let loaded = db.load_operations().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, op.id);
        assert_eq!(loaded[0].priority, Priority::Critical);
        assert_eq!(loaded[0].seq, 4);
        assert_eq!(loaded[0].payload, op.payload);
        assert_eq!(loaded[0].timestamp.timestamp_millis(), op.timestamp.timestamp_millis());

        assert!(db.update_retry_count(&op.id, 2).unwrap());
        assert_eq!(db.load_operations().unwrap()[0].retry_count, 2);

        assert!(db.remove_operation(&op.id).unwrap());
        assert!(db.load_operations().unwrap().is_empty());
    }

    #[test]
    fn test_load_operations_in_seq_order() {
        let db = Database::new_in_memory().unwrap();
        for seq in [3u64, 1, 2] {
            let op = OperationRequest::delete(meds("u1"), format!("med-{}", seq))
                .into_operation(3, seq)
                .unwrap();
            db.persist_operation(&op).unwrap();
        }
        let seqs: Vec<u64> = db.load_operations().unwrap().iter().map(|o| o.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_load_operations_skips_unreadable_rows() {
        let db = Database::new_in_memory().unwrap();
        let good = OperationRequest::delete(meds("u1"), "med-1").into_operation(3, 0).unwrap();
        db.persist_operation(&good).unwrap();
        db.connection()
            .execute(
                "INSERT INTO operation_queue (id, seq, op_type, collection, document_id, created_at, max_retries, priority)
                 VALUES ('bad', 1, 'delete', 'users/u1/medications', 'med-2', 0, 3, 'urgent')",
                [],
            )
            .unwrap();

        let loaded = db.load_operations().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);

        let rows: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM operation_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_remove_pending_for_document() {
        let db = Database::new_in_memory().unwrap();
        let create = OperationRequest::create(meds("u1"), "med-1", med_payload("x"))
            .into_operation(3, 0)
            .unwrap();
        let update = OperationRequest::update(meds("u1"), "med-1", med_payload("y"))
            .into_operation(3, 1)
            .unwrap();
        let other = OperationRequest::delete(meds("u1"), "med-2").into_operation(3, 2).unwrap();
        for op in [&create, &update, &other] {
            db.persist_operation(op).unwrap();
        }

        assert_eq!(db.remove_pending_for_document(&meds("u1"), "med-1").unwrap(), 2);
        let remaining = db.load_operations().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].document_id, "med-2");
    }

    #[test]
    fn test_remove_operations_for_owner() {
        let db = Database::new_in_memory().unwrap();
        let mine = OperationRequest::delete(meds("u1"), "a").into_operation(3, 0).unwrap();
        let theirs = OperationRequest::delete(meds("u2"), "b").into_operation(3, 1).unwrap();
        db.persist_operation(&mine).unwrap();
        db.persist_operation(&theirs).unwrap();

        assert_eq!(db.remove_operations_for_owner("u1").unwrap(), 1);
        assert_eq!(db.load_operations().unwrap()[0].owner_id.as_deref(), Some("u2"));
    }

    #[test]
    fn test_meta_roundtrip() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.get_meta("sync_stats").unwrap().is_none());
        db.put_meta("sync_stats", "{}").unwrap();
        db.put_meta("sync_stats", "{\"failedSyncs\":1}").unwrap();
        assert_eq!(
            db.get_meta("sync_stats").unwrap().as_deref(),
            Some("{\"failedSyncs\":1}")
        );
    }

    #[test]
    fn test_file_database_persists() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("sync.db");
        {
            let db = Database::new(&path).unwrap();
            db.put_meta("k", "v").unwrap();
        }
        let db = Database::new(&path).unwrap();
        assert_eq!(db.get_meta("k").unwrap().as_deref(), Some("v"));
    }
}
