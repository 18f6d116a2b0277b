//! Durable mirrors of the engine's working state.
//!
//! Three system tables back the engine:
//! - `__operations`: the operation queue, one row per queued operation
//! - `__item_backups`: pre-push row snapshots for error reporting
//! - `__sync_errors`: per-item push errors awaiting the end of the push
//!
//! [`DurableQueue`] keeps the pure in-memory queue and its `__operations`
//! mirror in lockstep: every enqueue is planned first, written to the
//! store, and only then committed to memory, so a crash can lose at most
//! an acknowledged-but-unapplied mutation, never invent one.

use std::sync::Arc;

use serde_json::{json, Value};
use tablesync_core::{Bookmark, OperationQueue, QueueChange, QueueError};
use tablesync_types::{
    OperationKind, OperationState, Query, StoreError, SyncError, TableOperation,
    TableOperationError, ITEM_BACKUPS_TABLE, OPERATIONS_TABLE, SYNC_ERRORS_TABLE,
};

use crate::store::LocalStore;

fn queue_error(error: QueueError) -> SyncError {
    match error {
        QueueError::PendingOperation { table, item_id } => {
            SyncError::PendingOperation { table, item_id }
        }
        QueueError::PendingDelete { table, item_id } => SyncError::PendingDelete { table, item_id },
    }
}

/// The operation queue with its `__operations` mirror.
pub(crate) struct DurableQueue {
    store: Arc<dyn LocalStore>,
    inner: OperationQueue,
}

impl DurableQueue {
    /// Rebuild the queue from the store (startup and crash recovery).
    pub async fn load(store: Arc<dyn LocalStore>) -> Result<Self, SyncError> {
        let rows = store.read(&Query::table(OPERATIONS_TABLE)).await?;
        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let op: TableOperation =
                serde_json::from_value(row).map_err(StoreError::Serialization)?;
            operations.push(op);
        }
        tracing::debug!(count = operations.len(), "restored operation queue");
        Ok(Self {
            store,
            inner: OperationQueue::restore(operations),
        })
    }

    /// Enqueue a mutation: plan, persist, then commit to memory.
    pub async fn enqueue(
        &mut self,
        kind: OperationKind,
        table_name: &str,
        item_id: &str,
        snapshot: Option<Value>,
    ) -> Result<(), SyncError> {
        let change = self
            .inner
            .plan_enqueue(kind, table_name, item_id, snapshot)
            .map_err(queue_error)?;
        self.persist(&change).await?;
        self.inner.commit(&change);
        Ok(())
    }

    async fn persist(&self, change: &QueueChange) -> Result<(), StoreError> {
        if let Some(removed) = &change.removed {
            self.store
                .delete_ids(OPERATIONS_TABLE, &[removed.id.to_string()])
                .await?;
        }
        if let Some(stored) = &change.stored {
            let row = serde_json::to_value(stored)?;
            self.store.upsert(OPERATIONS_TABLE, vec![row], true).await?;
        }
        Ok(())
    }

    pub fn count(&self, table_name: Option<&str>) -> u64 {
        self.inner.count(table_name)
    }

    pub fn pending_for(&self, table_name: &str, item_id: &str) -> Option<&TableOperation> {
        self.inner.pending_for(table_name, item_id)
    }

    pub fn bookmark(&mut self) -> Bookmark {
        self.inner.bookmark()
    }

    pub fn unbookmark(&mut self, bookmark: &Bookmark) {
        self.inner.unbookmark(bookmark)
    }

    pub fn peek(&self, bookmark: &Bookmark) -> Option<TableOperation> {
        self.inner.peek(bookmark).cloned()
    }

    /// Remove an operation from the store and then from memory.
    pub async fn dequeue(&mut self, operation: &TableOperation) -> Result<(), SyncError> {
        self.store
            .delete_ids(OPERATIONS_TABLE, &[operation.id.to_string()])
            .await?;
        self.inner.dequeue(operation.sequence);
        Ok(())
    }

    /// Update an operation's lifecycle state in memory and in the store.
    pub async fn set_state(
        &mut self,
        sequence: i64,
        state: OperationState,
    ) -> Result<(), SyncError> {
        if let Some(updated) = self.inner.set_state(sequence, state) {
            let row = serde_json::to_value(&updated).map_err(StoreError::Serialization)?;
            self.store.upsert(OPERATIONS_TABLE, vec![row], true).await?;
        }
        Ok(())
    }
}

/// Pre-push snapshots in `__item_backups`.
///
/// Before an operation is attempted, the row it is about to push is
/// backed up; if the operation fails permanently, the backup supplies the
/// `client_item` of the reported error even though the live row may have
/// changed or vanished since.
pub(crate) struct ItemBackups {
    store: Arc<dyn LocalStore>,
}

impl ItemBackups {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    fn backup_id(table_name: &str, item_id: &str) -> String {
        format!("{table_name}/{item_id}")
    }

    pub async fn save(
        &self,
        table_name: &str,
        item_id: &str,
        item: Option<&Value>,
    ) -> Result<(), SyncError> {
        let row = json!({
            "id": Self::backup_id(table_name, item_id),
            "tableName": table_name,
            "itemId": item_id,
            "item": item,
        });
        self.store
            .upsert(ITEM_BACKUPS_TABLE, vec![row], true)
            .await?;
        Ok(())
    }

    pub async fn get(&self, table_name: &str, item_id: &str) -> Result<Option<Value>, SyncError> {
        let row = self
            .store
            .lookup(ITEM_BACKUPS_TABLE, &Self::backup_id(table_name, item_id))
            .await?;
        Ok(row
            .and_then(|r| r.get("item").cloned())
            .filter(|item| !item.is_null()))
    }

    pub async fn remove(&self, table_name: &str, item_id: &str) -> Result<(), SyncError> {
        self.store
            .delete_ids(ITEM_BACKUPS_TABLE, &[Self::backup_id(table_name, item_id)])
            .await?;
        Ok(())
    }
}

/// Per-item push errors in `__sync_errors`.
///
/// Errors accumulate durably while a push runs and are drained into the
/// push result when it ends, so a crash mid-push cannot silently lose
/// them.
pub(crate) struct ErrorLog {
    store: Arc<dyn LocalStore>,
}

impl ErrorLog {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, error: &TableOperationError) -> Result<(), SyncError> {
        let row = serde_json::to_value(error).map_err(StoreError::Serialization)?;
        self.store.upsert(SYNC_ERRORS_TABLE, vec![row], true).await?;
        Ok(())
    }

    pub async fn drain(&self) -> Result<Vec<TableOperationError>, SyncError> {
        let rows = self.store.read(&Query::table(SYNC_ERRORS_TABLE)).await?;
        let mut errors = Vec::with_capacity(rows.len());
        for row in rows {
            let error: TableOperationError =
                serde_json::from_value(row).map_err(StoreError::Serialization)?;
            errors.push(error);
        }
        self.store
            .delete_by_query(&Query::table(SYNC_ERRORS_TABLE))
            .await?;
        Ok(errors)
    }
}
