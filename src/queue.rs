//! In-memory operation queue.
//!
//! Operations are kept in three priority bands and drained critical first,
//! then high, then normal; FIFO inside a band. A retried operation goes to the
//! tail of its band with a `ready_at` instant and is skipped until then, so a
//! backing-off operation never blocks other documents.
//!
//! Operations on one document always leave in enqueue order: only the
//! earliest pending operation of a document is eligible. A later
//! higher-priority operation pulls that earliest one forward, and anything
//! queued behind a backing-off operation waits for it.
//!
//! The durable copy lives in [`crate::database::Database`]; this structure is
//! owned by the sync engine task and mirrors it.

use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use crate::models::{CollectionPath, OperationType, Priority, QueuedOperation};

#[derive(Debug, Clone)]
struct Entry {
    op: QueuedOperation,
    ready_at: Option<Instant>,
}

impl Entry {
    fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.map_or(true, |at| at <= now)
    }

    fn targets(&self, collection: &CollectionPath, document_id: &str) -> bool {
        &self.op.collection == collection && self.op.document_id == document_id
    }
}

fn band_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
    }
}

/// Priority-banded FIFO queue of pending operations
#[derive(Debug, Default)]
pub struct OperationQueue {
    bands: [VecDeque<Entry>; 3],
    next_seq: u64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the queue from persisted operations (restart recovery)
    pub fn from_operations(mut ops: Vec<QueuedOperation>) -> Self {
        ops.sort_by_key(|op| op.seq);
        let mut queue = Self::new();
        for op in ops {
            queue.next_seq = queue.next_seq.max(op.seq + 1);
            queue.bands[band_index(op.priority)].push_back(Entry { op, ready_at: None });
        }
        queue
    }

    /// Allocate the next enqueue sequence number
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Append an operation to the tail of its band.
    ///
    /// A delete first removes every pending operation for the same document,
    /// which are returned so the caller can drop their durable copies.
    pub fn push(&mut self, op: QueuedOperation) -> Vec<QueuedOperation> {
        let coalesced = if op.op_type == OperationType::Delete {
            self.remove_for_document(&op.collection, &op.document_id)
        } else {
            Vec::new()
        };
        self.next_seq = self.next_seq.max(op.seq + 1);
        self.bands[band_index(op.priority)].push_back(Entry { op, ready_at: None });
        coalesced
    }

    /// Put a failed operation back at the tail of its band, not eligible before `ready_at`
    pub fn requeue(&mut self, op: QueuedOperation, ready_at: Instant) {
        self.bands[band_index(op.priority)].push_back(Entry {
            op,
            ready_at: Some(ready_at),
        });
    }

    fn entries(&self) -> impl Iterator<Item = (usize, usize, &Entry)> {
        self.bands
            .iter()
            .enumerate()
            .flat_map(|(band, entries)| {
                entries.iter().enumerate().map(move |(pos, e)| (band, pos, e))
            })
    }

    /// Position of the earliest pending operation for a document
    fn document_head(
        &self,
        collection: &CollectionPath,
        document_id: &str,
    ) -> Option<(usize, usize)> {
        self.entries()
            .filter(|(_, _, e)| e.targets(collection, document_id))
            .min_by_key(|(_, _, e)| e.op.seq)
            .map(|(band, pos, _)| (band, pos))
    }

    fn is_head(&self, band: usize, pos: usize, entry: &Entry) -> bool {
        self.document_head(&entry.op.collection, &entry.op.document_id) == Some((band, pos))
    }

    /// Take the next operation eligible at `now`.
    ///
    /// Candidates are visited in drain order; each one yields its document's
    /// earliest operation, which must itself be ready.
    pub fn pop_ready(&mut self, now: Instant) -> Option<QueuedOperation> {
        let (band, pos) = self
            .entries()
            .filter(|(_, _, e)| e.is_ready(now))
            .filter_map(|(_, _, e)| self.document_head(&e.op.collection, &e.op.document_id))
            .find(|&(band, pos)| self.bands[band][pos].is_ready(now))?;
        self.bands[band].remove(pos).map(|e| e.op)
    }

    /// Earliest instant at which a backing-off operation becomes eligible.
    ///
    /// Only document heads count; operations queued behind them cannot run first.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries()
            .filter(|&(band, pos, e)| self.is_head(band, pos, e))
            .filter_map(|(_, _, e)| e.ready_at)
            .min()
    }

    /// Remove all pending operations for a document
    pub fn remove_for_document(
        &mut self,
        collection: &CollectionPath,
        document_id: &str,
    ) -> Vec<QueuedOperation> {
        self.drain_matching(|e| e.targets(collection, document_id))
    }

    /// Remove all pending operations owned by a user
    pub fn remove_for_owner(&mut self, owner_id: &str) -> Vec<QueuedOperation> {
        self.drain_matching(|e| e.op.owner_id.as_deref() == Some(owner_id))
    }

    fn drain_matching(&mut self, mut matches: impl FnMut(&Entry) -> bool) -> Vec<QueuedOperation> {
        let mut removed = Vec::new();
        for band in self.bands.iter_mut() {
            let (taken, kept): (VecDeque<Entry>, VecDeque<Entry>) =
                band.drain(..).partition(|e| matches(e));
            *band = kept;
            removed.extend(taken.into_iter().map(|e| e.op));
        }
        removed
    }

    /// IDs of documents in a collection with pending operations
    pub fn pending_document_ids(&self, collection: &CollectionPath) -> HashSet<String> {
        self.bands
            .iter()
            .flatten()
            .filter(|e| &e.op.collection == collection)
            .map(|e| e.op.document_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    /// Copy of the queue in drain order
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.bands
            .iter()
            .flatten()
            .map(|e| e.op.clone())
            .collect()
    }
}
