//! The in-memory operation queue.
//!
//! A total order of pending per-item mutations with:
//! - at most one operation per `(table, item id)` pair, maintained by
//!   coalescing later mutations into the existing operation
//! - bookmarks capturing a stable tail so one push processes a fixed
//!   snapshot even while new operations are enqueued concurrently
//!
//! The queue itself performs no I/O. [`OperationQueue::plan_enqueue`]
//! returns the durable [`QueueChange`] to write; callers persist it and
//! then [`commit`](OperationQueue::commit) it, so the in-memory state
//! never runs ahead of the store.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tablesync_types::{OperationKind, OperationState, TableOperation};

/// Error type for enqueue planning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The item already has a pending operation that does not admit the
    /// new mutation (insert over a pending insert or update).
    #[error("item {table}/{item_id} already has a pending operation")]
    PendingOperation {
        /// Target table.
        table: String,
        /// Target item id.
        item_id: String,
    },

    /// Update against an item with a pending delete.
    #[error("item {table}/{item_id} has a pending delete")]
    PendingDelete {
        /// Target table.
        table: String,
        /// Target item id.
        item_id: String,
    },
}

/// The durable effect of one enqueue: which operation row to delete and
/// which to upsert. Both may be empty (the mutation coalesced into the
/// existing operation without changing it) or both set (a pending delete
/// cancelled by a fresh insert).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueChange {
    /// Operation to remove from durable storage.
    pub removed: Option<TableOperation>,
    /// Operation to write to durable storage.
    pub stored: Option<TableOperation>,
}

impl QueueChange {
    /// Whether this change has no durable effect.
    pub fn is_empty(&self) -> bool {
        self.removed.is_none() && self.stored.is_none()
    }
}

/// A stable snapshot marker over the queue.
///
/// Operations with `sequence < bound` existed when the bookmark was
/// taken; a push scoped to the bookmark never sees later enqueues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    id: u64,
    bound: i64,
}

impl Bookmark {
    /// Exclusive upper sequence bound of this bookmark.
    pub fn bound(&self) -> i64 {
        self.bound
    }
}

/// The ordered queue of pending operations.
#[derive(Debug, Default)]
pub struct OperationQueue {
    /// Operations by sequence (iteration order is queue order).
    ops: BTreeMap<i64, TableOperation>,
    /// `(table, item id)` → sequence of the pending operation.
    index: HashMap<(String, String), i64>,
    /// Next sequence to assign.
    next_sequence: i64,
    /// Active bookmarks by id.
    bookmarks: HashMap<u64, i64>,
    next_bookmark_id: u64,
}

impl OperationQueue {
    /// Create an empty queue. Sequences start at 1.
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: 1,
            bookmarks: HashMap::new(),
            next_bookmark_id: 0,
        }
    }

    /// Rebuild the queue from durable operation rows (crash recovery).
    ///
    /// Sequence assignment continues after the highest restored sequence.
    pub fn restore(operations: Vec<TableOperation>) -> Self {
        let mut queue = Self::new();
        for op in operations {
            queue.next_sequence = queue.next_sequence.max(op.sequence + 1);
            queue
                .index
                .insert((op.table_name.clone(), op.item_id.clone()), op.sequence);
            queue.ops.insert(op.sequence, op);
        }
        queue
    }

    /// Plan the durable effect of enqueueing a mutation, applying the
    /// coalescing rules:
    ///
    /// - no pending operation → a new pending operation is appended
    /// - insert + update → the insert stands (payload is read live at push)
    /// - insert + delete → both cancel
    /// - update + update → the update stands
    /// - update + delete → collapses to a delete at the same sequence
    /// - delete + insert → the delete cancels and a fresh insert is
    ///   appended (a new logical item reusing the id)
    ///
    /// `snapshot` is the pre-delete row copy and is only consulted for
    /// delete mutations.
    ///
    /// Planning does not mutate the queue; persist the returned change,
    /// then [`commit`](Self::commit) it.
    pub fn plan_enqueue(
        &self,
        kind: OperationKind,
        table_name: &str,
        item_id: &str,
        snapshot: Option<Value>,
    ) -> Result<QueueChange, QueueError> {
        let key = (table_name.to_string(), item_id.to_string());
        let existing = self.index.get(&key).and_then(|seq| self.ops.get(seq));

        let Some(existing) = existing else {
            let item = match kind {
                OperationKind::Delete => snapshot,
                _ => None,
            };
            return Ok(QueueChange {
                removed: None,
                stored: Some(TableOperation::new(
                    kind,
                    table_name,
                    item_id,
                    self.next_sequence,
                    item,
                )),
            });
        };

        match (existing.kind, kind) {
            // The pending insert already pushes whatever the store holds.
            (OperationKind::Insert, OperationKind::Update) => Ok(QueueChange::default()),
            (OperationKind::Insert, OperationKind::Delete) => Ok(QueueChange {
                removed: Some(existing.clone()),
                stored: None,
            }),
            (OperationKind::Update, OperationKind::Update) => Ok(QueueChange::default()),
            (OperationKind::Update, OperationKind::Delete) => {
                // Collapse in place: same sequence, same durable row.
                let mut collapsed = existing.clone();
                collapsed.kind = OperationKind::Delete;
                collapsed.state = OperationState::Pending;
                collapsed.item = snapshot;
                Ok(QueueChange {
                    removed: None,
                    stored: Some(collapsed),
                })
            }
            (OperationKind::Delete, OperationKind::Insert) => Ok(QueueChange {
                removed: Some(existing.clone()),
                stored: Some(TableOperation::new(
                    OperationKind::Insert,
                    table_name,
                    item_id,
                    self.next_sequence,
                    None,
                )),
            }),
            (OperationKind::Delete, OperationKind::Delete) => Ok(QueueChange::default()),
            (OperationKind::Delete, OperationKind::Update) => Err(QueueError::PendingDelete {
                table: table_name.to_string(),
                item_id: item_id.to_string(),
            }),
            (_, OperationKind::Insert) => Err(QueueError::PendingOperation {
                table: table_name.to_string(),
                item_id: item_id.to_string(),
            }),
        }
    }

    /// Apply a planned change to the in-memory state.
    pub fn commit(&mut self, change: &QueueChange) {
        if let Some(removed) = &change.removed {
            self.ops.remove(&removed.sequence);
            let key = (removed.table_name.clone(), removed.item_id.clone());
            if self.index.get(&key) == Some(&removed.sequence) {
                self.index.remove(&key);
            }
        }
        if let Some(stored) = &change.stored {
            self.next_sequence = self.next_sequence.max(stored.sequence + 1);
            self.index.insert(
                (stored.table_name.clone(), stored.item_id.clone()),
                stored.sequence,
            );
            self.ops.insert(stored.sequence, stored.clone());
        }
    }

    /// Plan and immediately commit an enqueue (for callers without a
    /// durable mirror, e.g. tests).
    pub fn enqueue(
        &mut self,
        kind: OperationKind,
        table_name: &str,
        item_id: &str,
        snapshot: Option<Value>,
    ) -> Result<QueueChange, QueueError> {
        let change = self.plan_enqueue(kind, table_name, item_id, snapshot)?;
        self.commit(&change);
        Ok(change)
    }

    /// Count queued operations, optionally restricted to one table.
    pub fn count(&self, table_name: Option<&str>) -> u64 {
        match table_name {
            None => self.ops.len() as u64,
            Some(table) => self
                .ops
                .values()
                .filter(|op| op.table_name == table)
                .count() as u64,
        }
    }

    /// The pending operation for an item, if any.
    pub fn pending_for(&self, table_name: &str, item_id: &str) -> Option<&TableOperation> {
        let key = (table_name.to_string(), item_id.to_string());
        self.index.get(&key).and_then(|seq| self.ops.get(seq))
    }

    /// Capture the current tail as a bookmark.
    pub fn bookmark(&mut self) -> Bookmark {
        let id = self.next_bookmark_id;
        self.next_bookmark_id += 1;
        self.bookmarks.insert(id, self.next_sequence);
        Bookmark {
            id,
            bound: self.next_sequence,
        }
    }

    /// Discard a bookmark once its push has completed.
    pub fn unbookmark(&mut self, bookmark: &Bookmark) {
        self.bookmarks.remove(&bookmark.id);
    }

    /// The oldest operation inside the bookmark, if any remains.
    pub fn peek(&self, bookmark: &Bookmark) -> Option<&TableOperation> {
        self.ops.range(..bookmark.bound).map(|(_, op)| op).next()
    }

    /// Remove the operation at the given sequence.
    pub fn dequeue(&mut self, sequence: i64) -> Option<TableOperation> {
        let op = self.ops.remove(&sequence)?;
        let key = (op.table_name.clone(), op.item_id.clone());
        if self.index.get(&key) == Some(&sequence) {
            self.index.remove(&key);
        }
        Some(op)
    }

    /// Update the lifecycle state of the operation at the given sequence,
    /// returning the updated operation for durable persistence.
    pub fn set_state(&mut self, sequence: i64, state: OperationState) -> Option<TableOperation> {
        let op = self.ops.get_mut(&sequence)?;
        op.state = state;
        Some(op.clone())
    }

    /// Total number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
