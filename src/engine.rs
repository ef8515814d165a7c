//! The sync engine.
//!
//! A single actor task owns the in-memory queue and the stats. Every mutation
//! reaches it as a [`Command`] over an unbounded channel, so enqueue never
//! waits on the network. The actor drains the queue against the remote store
//! only while online and permission-ready, with at most one remote attempt in
//! flight. Queue, status, stats and connectivity are published on `watch`
//! channels; per-operation outcomes go out as [`SyncEvent`]s on a broadcast
//! channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conflicts::{
    decide_conflict, ConflictDecision, ConflictManager, ConflictRecord, ResolutionChoice,
};
use crate::database::{lock_db, Database, SharedDatabase, INDEX_OWNER_ID};
use crate::error::{MedSyncError, MedSyncResult};
use crate::models::{
    CachedEntity, OperationRequest, OperationType, Priority, QueuedOperation, SyncProgress,
    SyncStats, SyncStatus,
};
use crate::permissions::PermissionState;
use crate::queue::OperationQueue;
use crate::remote::{apply_operation, DocumentRef, RemoteError, RemoteSnapshot, RemoteStore};
use crate::stats::{load_stats, save_stats};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime retry and timeout policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bound on a single remote attempt
    pub request_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    /// Delay before the next attempt: `base * 2^(retry_count - 1)`, capped
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Per-operation notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Queued {
        op_id: String,
        priority: Priority,
    },
    /// Pending operations dropped because a later delete superseded them
    Coalesced {
        superseded: Vec<String>,
        by: String,
    },
    /// Pending operations dropped because their session ended
    Discarded {
        op_ids: Vec<String>,
    },
    Synced {
        op_id: String,
    },
    RetryScheduled {
        op_id: String,
        retry_count: u32,
        delay: Duration,
    },
    Failed {
        op_id: String,
        reason: String,
        exhausted: bool,
    },
    ConflictResolved {
        op_id: String,
    },
    ConflictUnresolved {
        op_id: String,
        conflict_id: String,
    },
    /// Durable persistence failed; the operation lives in memory only
    Degraded {
        op_id: String,
        reason: String,
    },
}

/// Final result of one operation as seen by [`SyncHandle::queue_and_confirm`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Synced,
    Failed(String),
    /// Recorded for manual reconciliation under this conflict id
    ConflictUnresolved(String),
    Superseded,
    /// Still queued when the wait ran out
    Pending,
}

/// Counts from applying one remote snapshot to the local cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub written: usize,
    pub removed: usize,
    /// Documents left alone because a local operation is pending
    pub skipped_pending: usize,
}

enum Command {
    Enqueue {
        request: OperationRequest,
        reply: oneshot::Sender<MedSyncResult<QueuedOperation>>,
    },
    ResolveConflict {
        conflict_id: String,
        choice: ResolutionChoice,
        reply: oneshot::Sender<MedSyncResult<ConflictRecord>>,
    },
    EndSession {
        owner_id: String,
        reply: oneshot::Sender<MedSyncResult<usize>>,
    },
    Reconcile {
        snapshot: RemoteSnapshot,
        reply: oneshot::Sender<MedSyncResult<ReconcileReport>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

#[derive(Debug)]
enum AttemptOutcome {
    Synced,
    ConflictResolved,
    Transient(RemoteError),
    Rejected(RemoteError),
    ConflictUnresolved {
        server_modified_at: Option<DateTime<Utc>>,
        reason: String,
    },
}

struct AttemptReport {
    op: QueuedOperation,
    outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOutcome {
    None,
    Success,
    Failure,
}

async fn with_timeout<F>(timeout: Duration, attempt: F) -> Result<(), RemoteError>
where
    F: std::future::Future<Output = Result<(), RemoteError>>,
{
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::transient(format!(
            "no response within {:?}",
            timeout
        ))),
    }
}

/// One remote attempt, including last-write-wins resolution on conflict
async fn run_attempt(
    remote: &dyn RemoteStore,
    op: &QueuedOperation,
    timeout: Duration,
) -> AttemptOutcome {
    let server_modified_at = match with_timeout(timeout, apply_operation(remote, op)).await {
        Ok(()) => return AttemptOutcome::Synced,
        Err(RemoteError::Conflict { server_modified_at }) => server_modified_at,
        Err(e) if e.is_retryable() => return AttemptOutcome::Transient(e),
        Err(e) => return AttemptOutcome::Rejected(e),
    };

    let decision = decide_conflict(op.op_type, op.timestamp, server_modified_at);
    if !decision.needs_overwrite() {
        return match decision {
            ConflictDecision::AlreadyDeleted => AttemptOutcome::Synced,
            _ => AttemptOutcome::ConflictUnresolved {
                server_modified_at,
                reason: "server copy is newer".to_string(),
            },
        };
    }

    debug!(op_id = %op.id, ?decision, "Applying last-write-wins overwrite");
    let target = DocumentRef::of(op);
    let payload = match op.op_type {
        OperationType::Delete => None,
        _ => op.payload.as_ref(),
    };
    match with_timeout(timeout, remote.overwrite(&target, payload)).await {
        Ok(()) => AttemptOutcome::ConflictResolved,
        Err(e) => AttemptOutcome::ConflictUnresolved {
            server_modified_at,
            reason: format!("overwrite failed: {}", e),
        },
    }
}

async fn join_in_flight(
    in_flight: &mut Option<JoinHandle<AttemptReport>>,
) -> Result<AttemptReport, JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The queue-owning actor
pub struct SyncEngine {
    db: SharedDatabase,
    remote: Arc<dyn RemoteStore>,
    settings: EngineSettings,
    queue: OperationQueue,
    stats: SyncStats,
    last_outcome: LastOutcome,
    online: bool,
    /// `None` when no permission gate is configured
    permission: Option<PermissionState>,
    in_flight_op: Option<QueuedOperation>,
    /// Set when the in-flight operation was coalesced or discarded meanwhile
    in_flight_superseded: bool,
    idle_waiters: Vec<oneshot::Sender<()>>,
    queue_tx: watch::Sender<Vec<QueuedOperation>>,
    status_tx: watch::Sender<SyncStatus>,
    stats_tx: watch::Sender<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    /// Recover persisted state and start the actor on the current runtime.
    ///
    /// Without a permission receiver the engine drains on connectivity alone.
    pub fn spawn(
        db: SharedDatabase,
        remote: Arc<dyn RemoteStore>,
        mut connectivity: watch::Receiver<bool>,
        mut permission: Option<watch::Receiver<PermissionState>>,
        settings: EngineSettings,
    ) -> SyncHandle {
        let (queue, stats) = Self::recover(&db);
        let online = *connectivity.borrow_and_update();
        let permission_state = permission.as_mut().map(|rx| *rx.borrow_and_update());
        if permission.is_none() {
            info!("No permission gate configured, draining on connectivity alone");
        }

        let (queue_tx, queue_rx) = watch::channel(queue.snapshot());
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        let (stats_tx, stats_rx) = watch::channel(stats.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let engine = Self {
            db: db.clone(),
            remote,
            settings,
            queue,
            stats,
            last_outcome: LastOutcome::None,
            online,
            permission: permission_state,
            in_flight_op: None,
            in_flight_superseded: false,
            idle_waiters: Vec::new(),
            queue_tx,
            status_tx,
            stats_tx,
            events: events.clone(),
        };

        let handle = SyncHandle {
            commands,
            queue_rx,
            status_rx,
            stats_rx,
            online_rx: connectivity.clone(),
            events,
            db,
        };

        tokio::spawn(engine.run(commands_rx, connectivity, permission));
        handle
    }

    fn recover(db: &SharedDatabase) -> (OperationQueue, SyncStats) {
        let db = match lock_db(db) {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "Failed to recover sync state, starting empty");
                return (OperationQueue::new(), SyncStats::default());
            }
        };

        let ops = db.load_operations().unwrap_or_else(|e| {
            error!(error = %e, "Failed to load queued operations, starting with an empty queue");
            Vec::new()
        });
        let mut stats = load_stats(&db).unwrap_or_else(|e| {
            error!(error = %e, "Failed to load sync stats, starting from zero");
            SyncStats::default()
        });

        if !ops.is_empty() {
            info!(count = ops.len(), "Recovered queued operations");
        }
        let queue = OperationQueue::from_operations(ops);
        stats.pending_operations = queue.len() as u64;
        (queue, stats)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connectivity: watch::Receiver<bool>,
        mut permission: Option<watch::Receiver<PermissionState>>,
    ) {
        let mut in_flight: Option<JoinHandle<AttemptReport>> = None;
        let mut connectivity_open = true;
        let mut permission_open = permission.is_some();

        loop {
            // Commands observe the latest signals even when a change is not yet polled
            self.online = *connectivity.borrow_and_update();
            if let Some(rx) = permission.as_mut() {
                self.permission = Some(*rx.borrow_and_update());
            }

            if in_flight.is_none() {
                in_flight = self.start_next();
            }
            self.publish();
            self.notify_idle();

            let wake_at = if in_flight.is_none() && self.can_drain() {
                self.queue.next_ready_at()
            } else {
                None
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                joined = join_in_flight(&mut in_flight) => {
                    in_flight = None;
                    self.finish_attempt(joined);
                }
                changed = connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        self.online = *connectivity.borrow_and_update();
                        debug!(online = self.online, "Engine saw connectivity change");
                    }
                    Err(_) => connectivity_open = false,
                },
                changed = async {
                    match permission.as_mut() {
                        Some(rx) => rx.changed().await.map(|_| *rx.borrow_and_update()),
                        None => std::future::pending().await,
                    }
                }, if permission_open => match changed {
                    Ok(state) => {
                        self.permission = Some(state);
                        debug!(?state, "Engine saw permission change");
                    }
                    Err(_) => permission_open = false,
                },
                _ = sleep_until_opt(wake_at) => {}
            }
        }

        if let Some(handle) = in_flight {
            handle.abort();
        }
        info!("Sync engine stopped");
    }

    fn can_drain(&self) -> bool {
        self.online
            && self
                .permission
                .map_or(true, |state| state == PermissionState::Ready)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn start_next(&mut self) -> Option<JoinHandle<AttemptReport>> {
        if !self.can_drain() {
            return None;
        }
        let op = self.queue.pop_ready(Instant::now())?;
        debug!(
            op_id = %op.id,
            collection = %op.collection,
            document_id = %op.document_id,
            retry_count = op.retry_count,
            "Attempting remote write"
        );

        self.in_flight_op = Some(op.clone());
        self.in_flight_superseded = false;
        let remote = Arc::clone(&self.remote);
        let timeout = self.settings.request_timeout;
        Some(tokio::spawn(async move {
            let outcome = run_attempt(remote.as_ref(), &op, timeout).await;
            AttemptReport { op, outcome }
        }))
    }

    fn finish_attempt(&mut self, joined: Result<AttemptReport, JoinError>) {
        let superseded = std::mem::take(&mut self.in_flight_superseded);
        let in_flight_op = self.in_flight_op.take();

        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Remote attempt task failed");
                let Some(op) = in_flight_op else { return };
                AttemptReport {
                    op,
                    outcome: AttemptOutcome::Transient(RemoteError::transient(e.to_string())),
                }
            }
        };

        let succeeded = matches!(
            report.outcome,
            AttemptOutcome::Synced | AttemptOutcome::ConflictResolved
        );
        if superseded && !succeeded {
            debug!(op_id = %report.op.id, "Dropping result of superseded operation");
            self.forget_operation(&report.op.id);
            return;
        }
        self.handle_report(report);
    }

    fn handle_report(&mut self, report: AttemptReport) {
        let AttemptReport { mut op, outcome } = report;
        match outcome {
            AttemptOutcome::Synced => {
                self.forget_operation(&op.id);
                self.record_success();
                debug!(op_id = %op.id, "Operation synced");
                self.emit(SyncEvent::Synced { op_id: op.id });
            }
            AttemptOutcome::ConflictResolved => {
                self.forget_operation(&op.id);
                self.stats.resolved_conflicts += 1;
                self.record_success();
                info!(op_id = %op.id, "Conflict resolved by last-write-wins");
                self.emit(SyncEvent::ConflictResolved { op_id: op.id });
            }
            AttemptOutcome::Transient(e) => {
                op.retry_count += 1;
                self.last_outcome = LastOutcome::Failure;
                if op.can_retry() {
                    let delay = self.settings.backoff_for(op.retry_count);
                    let persisted = lock_db(&self.db)
                        .and_then(|db| db.update_retry_count(&op.id, op.retry_count));
                    if let Err(db_err) = persisted {
                        warn!(op_id = %op.id, error = %db_err, "Failed to persist retry count");
                    }
                    warn!(
                        op_id = %op.id,
                        retry_count = op.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    self.emit(SyncEvent::RetryScheduled {
                        op_id: op.id.clone(),
                        retry_count: op.retry_count,
                        delay,
                    });
                    self.queue.requeue(op, Instant::now() + delay);
                } else {
                    self.forget_operation(&op.id);
                    self.stats.failed_syncs += 1;
                    error!(
                        op_id = %op.id,
                        retry_count = op.retry_count,
                        error = %e,
                        "Retries exhausted"
                    );
                    self.emit(SyncEvent::Failed {
                        op_id: op.id,
                        reason: e.to_string(),
                        exhausted: true,
                    });
                }
            }
            AttemptOutcome::Rejected(e) => {
                self.forget_operation(&op.id);
                self.stats.failed_syncs += 1;
                self.last_outcome = LastOutcome::Failure;
                error!(
                    op_id = %op.id,
                    collection = %op.collection,
                    document_id = %op.document_id,
                    error = %e,
                    "Remote rejected operation, dropping"
                );
                self.emit(SyncEvent::Failed {
                    op_id: op.id,
                    reason: e.to_string(),
                    exhausted: false,
                });
            }
            AttemptOutcome::ConflictUnresolved {
                server_modified_at,
                reason,
            } => {
                let record = ConflictRecord::from_operation(&op, server_modified_at);
                let stored = lock_db(&self.db).and_then(|db| {
                    db.record_conflict(&record)?;
                    db.remove_operation(&op.id)
                });
                if let Err(e) = stored {
                    // Keep the operation queued rather than lose the payload
                    error!(op_id = %op.id, error = %e, "Failed to record conflict, requeueing");
                    let delay = self.settings.backoff_max;
                    self.queue.requeue(op, Instant::now() + delay);
                    self.last_outcome = LastOutcome::Failure;
                    return;
                }
                self.stats.unresolved_conflicts += 1;
                self.last_outcome = LastOutcome::Failure;
                warn!(
                    op_id = %op.id,
                    conflict_id = %record.id,
                    reason = %reason,
                    "Conflict needs manual reconciliation"
                );
                self.emit(SyncEvent::ConflictUnresolved {
                    op_id: op.id,
                    conflict_id: record.id,
                });
            }
        }
    }

    fn record_success(&mut self) {
        self.stats.successful_syncs += 1;
        self.stats.last_sync_time = Some(Utc::now());
        self.last_outcome = LastOutcome::Success;
    }

    fn forget_operation(&self, op_id: &str) {
        if let Err(e) = lock_db(&self.db).and_then(|db| db.remove_operation(op_id)) {
            warn!(op_id, error = %e, "Failed to remove operation from durable store");
        }
    }

    /// Handle a command. Observers are updated before the caller hears back.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, reply } => {
                let result = self.enqueue(request);
                self.publish();
                let _ = reply.send(result);
            }
            Command::ResolveConflict {
                conflict_id,
                choice,
                reply,
            } => {
                let result = self.resolve_conflict(&conflict_id, choice);
                self.publish();
                let _ = reply.send(result);
            }
            Command::EndSession { owner_id, reply } => {
                let result = self.end_session(&owner_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Reconcile { snapshot, reply } => {
                let _ = reply.send(self.reconcile(snapshot));
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
            Command::Shutdown => {}
        }
    }

    fn in_flight_targets(&self, op: &QueuedOperation) -> bool {
        self.in_flight_op
            .as_ref()
            .is_some_and(|f| f.collection == op.collection && f.document_id == op.document_id)
    }

    fn enqueue(&mut self, request: OperationRequest) -> MedSyncResult<QueuedOperation> {
        let seq = self.queue.next_seq();
        let mut op = request.into_operation(self.settings.max_retries, seq)?;

        if op.op_type == OperationType::Delete && self.in_flight_targets(&op) {
            self.in_flight_superseded = true;
        }

        let persisted = lock_db(&self.db).and_then(|db| {
            if op.op_type == OperationType::Delete {
                db.remove_pending_for_document(&op.collection, &op.document_id)?;
            }
            db.persist_operation(&op)
        });
        if let Err(e) = persisted {
            warn!(
                op_id = %op.id,
                error = %e,
                "Durable persistence failed, keeping operation in memory"
            );
            op.degraded = true;
            self.emit(SyncEvent::Degraded {
                op_id: op.id.clone(),
                reason: e.to_string(),
            });
        }

        if let Err(e) = lock_db(&self.db).and_then(|db| apply_to_cache(&db, &op)) {
            warn!(op_id = %op.id, error = %e, "Failed to apply operation to local cache");
        }

        let superseded = self.queue.push(op.clone());
        debug!(
            op_id = %op.id,
            op_type = op.op_type.as_str(),
            collection = %op.collection,
            document_id = %op.document_id,
            priority = op.priority.as_str(),
            "Operation queued"
        );

        if !superseded.is_empty() {
            self.emit(SyncEvent::Coalesced {
                superseded: superseded.into_iter().map(|o| o.id).collect(),
                by: op.id.clone(),
            });
        }
        self.emit(SyncEvent::Queued {
            op_id: op.id.clone(),
            priority: op.priority,
        });
        Ok(op)
    }

    fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        choice: ResolutionChoice,
    ) -> MedSyncResult<ConflictRecord> {
        let record = {
            let db = lock_db(&self.db)?;
            ConflictManager::new(&db).resolve(conflict_id, choice)?
        };
        self.stats.resolved_conflicts += 1;
        info!(conflict_id = %record.id, choice = choice.as_str(), "Conflict resolved manually");

        if choice == ResolutionChoice::KeepLocal {
            self.enqueue(record.to_request())?;
        }
        Ok(record)
    }

    fn end_session(&mut self, owner_id: &str) -> MedSyncResult<usize> {
        let discarded = self.queue.remove_for_owner(owner_id);
        if self
            .in_flight_op
            .as_ref()
            .is_some_and(|op| op.owner_id.as_deref() == Some(owner_id))
        {
            self.in_flight_superseded = true;
        }

        lock_db(&self.db)?.remove_operations_for_owner(owner_id)?;

        if !discarded.is_empty() {
            info!(owner_id, count = discarded.len(), "Discarded uncommitted operations");
            self.emit(SyncEvent::Discarded {
                op_ids: discarded.iter().map(|o| o.id.clone()).collect(),
            });
        }
        Ok(discarded.len())
    }

    fn reconcile(&mut self, snapshot: RemoteSnapshot) -> MedSyncResult<ReconcileReport> {
        let collection = &snapshot.collection;
        let mut pending = self.queue.pending_document_ids(collection);
        if let Some(op) = &self.in_flight_op {
            if &op.collection == collection {
                pending.insert(op.document_id.clone());
            }
        }

        let entities: Vec<CachedEntity> = snapshot
            .documents
            .iter()
            .filter(|d| !pending.contains(&d.id))
            .map(|d| CachedEntity {
                collection: collection.clone(),
                id: d.id.clone(),
                owner_id: Some(snapshot.owner_id.clone()),
                payload: d.payload.clone(),
                updated_at: d.modified_at.unwrap_or_else(Utc::now),
            })
            .collect();
        let skipped_pending = snapshot.documents.len() - entities.len();
        let remote_ids: HashSet<&str> = snapshot.documents.iter().map(|d| d.id.as_str()).collect();

        let db = lock_db(&self.db)?;
        let written = db.put_batch(collection, &entities)?;

        let mut removed = 0;
        for cached in db.get_by_index(collection, INDEX_OWNER_ID, &snapshot.owner_id)? {
            if !remote_ids.contains(cached.id.as_str()) && !pending.contains(&cached.id) {
                db.delete(collection, &cached.id)?;
                removed += 1;
            }
        }

        debug!(collection = %collection, written, removed, skipped_pending, "Snapshot reconciled");
        Ok(ReconcileReport {
            written,
            removed,
            skipped_pending,
        })
    }

    fn pending_count(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight_op.is_some())
    }

    fn status(&self) -> SyncStatus {
        if self.in_flight_op.is_some() {
            SyncStatus::Syncing
        } else if self.pending_count() == 0 {
            match self.last_outcome {
                LastOutcome::Success => SyncStatus::Synced,
                _ => SyncStatus::Idle,
            }
        } else if self.last_outcome == LastOutcome::Failure {
            SyncStatus::Error
        } else {
            SyncStatus::Idle
        }
    }

    fn publish(&mut self) {
        self.stats.pending_operations = self.pending_count() as u64;

        let mut snapshot = Vec::with_capacity(self.pending_count());
        snapshot.extend(self.in_flight_op.iter().cloned());
        snapshot.extend(self.queue.snapshot());
        self.queue_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if *self.stats_tx.borrow() != self.stats {
            if let Err(e) = lock_db(&self.db).and_then(|db| save_stats(&db, &self.stats)) {
                warn!(error = %e, "Failed to persist sync stats");
            }
            self.stats_tx.send_replace(self.stats.clone());
        }
    }

    /// Answer idle waiters once the drain cannot make further progress
    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() {
            return;
        }
        if self.in_flight_op.is_none() && (!self.can_drain() || self.queue.is_empty()) {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Mirror a queued mutation into the local cache so reads see it offline
fn apply_to_cache(db: &Database, op: &QueuedOperation) -> MedSyncResult<()> {
    match (op.op_type, &op.payload) {
        (OperationType::Delete, _) => {
            db.delete(&op.collection, &op.document_id)?;
        }
        (_, Some(payload)) => {
            db.put(&CachedEntity::new(
                op.collection.clone(),
                op.document_id.clone(),
                payload.clone(),
            ))?;
        }
        (_, None) => {}
    }
    Ok(())
}

/// Cloneable handle to a running [`SyncEngine`]
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    queue_rx: watch::Receiver<Vec<QueuedOperation>>,
    status_rx: watch::Receiver<SyncStatus>,
    stats_rx: watch::Receiver<SyncStats>,
    online_rx: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
    db: SharedDatabase,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> MedSyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| MedSyncError::EngineStopped)?;
        rx.await.map_err(|_| MedSyncError::EngineStopped)
    }

    /// Queue a mutation. Returns once it is persisted and applied locally;
    /// never waits on the network.
    pub async fn queue_operation(
        &self,
        request: OperationRequest,
    ) -> MedSyncResult<QueuedOperation> {
        self.request(|reply| Command::Enqueue { request, reply })
            .await?
    }

    /// Queue a mutation and wait up to `wait` for its final outcome.
    ///
    /// Meant for critical events that should reach the remote right away when
    /// possible; the operation stays queued if the wait runs out.
    pub async fn queue_and_confirm(
        &self,
        request: OperationRequest,
        wait: Duration,
    ) -> MedSyncResult<OperationOutcome> {
        let mut events = self.events.subscribe();
        let op = self.queue_operation(request).await?;

        let outcome = tokio::time::timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(outcome) = outcome_for(&op.id, event) {
                            return Ok(outcome);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event receiver lagged while confirming operation");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MedSyncError::EngineStopped);
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Ok(OperationOutcome::Pending),
        }
    }

    /// Resolve a recorded conflict by id or unique id prefix
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ResolutionChoice,
    ) -> MedSyncResult<ConflictRecord> {
        let conflict_id = conflict_id.to_string();
        self.request(|reply| Command::ResolveConflict {
            conflict_id,
            choice,
            reply,
        })
        .await?
    }

    /// Conflicts recorded for manual reconciliation
    pub fn conflicts(&self, include_resolved: bool) -> MedSyncResult<Vec<ConflictRecord>> {
        let db = lock_db(&self.db)?;
        ConflictManager::new(&db).get_conflicts(include_resolved)
    }

    /// Drop every queued operation owned by `owner_id`. Returns how many were dropped.
    pub async fn end_session(&self, owner_id: &str) -> MedSyncResult<usize> {
        let owner_id = owner_id.to_string();
        self.request(|reply| Command::EndSession { owner_id, reply })
            .await?
    }

    /// Apply a live-query snapshot to the local cache
    pub async fn reconcile_snapshot(
        &self,
        snapshot: RemoteSnapshot,
    ) -> MedSyncResult<ReconcileReport> {
        self.request(|reply| Command::Reconcile { snapshot, reply })
            .await?
    }

    /// Wait until the drain can make no further progress: the queue is empty,
    /// or draining is blocked by connectivity or permissions.
    pub async fn wait_idle(&self) -> MedSyncResult<()> {
        self.request(|reply| Command::WaitIdle { reply }).await
    }

    /// Stop the engine; an in-flight attempt is abandoned and stays queued durably
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn operation_queue(&self) -> watch::Receiver<Vec<QueuedOperation>> {
        self.queue_rx.clone()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn sync_stats(&self) -> watch::Receiver<SyncStats> {
        self.stats_rx.clone()
    }

    pub fn is_online(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Aggregate counts for a progress indicator
    pub fn progress(&self) -> SyncProgress {
        SyncProgress::from_stats(&self.stats_rx.borrow())
    }

    /// The local store, for UI reads
    pub fn database(&self) -> SharedDatabase {
        Arc::clone(&self.db)
    }
}

fn outcome_for(op_id: &str, event: SyncEvent) -> Option<OperationOutcome> {
    match event {
        SyncEvent::Synced { op_id: id } | SyncEvent::ConflictResolved { op_id: id }
            if id == op_id =>
        {
            Some(OperationOutcome::Synced)
        }
        SyncEvent::Failed { op_id: id, reason, .. } if id == op_id => {
            Some(OperationOutcome::Failed(reason))
        }
        SyncEvent::ConflictUnresolved {
            op_id: id,
            conflict_id,
        } if id == op_id => Some(OperationOutcome::ConflictUnresolved(conflict_id)),
        SyncEvent::Coalesced { superseded, .. } if superseded.iter().any(|id| id == op_id) => {
            Some(OperationOutcome::Superseded)
        }
        SyncEvent::Discarded { op_ids } if op_ids.iter().any(|id| id == op_id) => {
            Some(OperationOutcome::Superseded)
        }
        _ => None,
    }
}
