//! The push consumer.
//!
//! All pushes run on one task per context, consuming [`PushRequest`]s
//! from a channel. Each push snapshots the queue with a bookmark and
//! drains the operations inside it oldest-first; operations enqueued
//! after the snapshot wait for the next push. Callers are answered
//! through the request's one-shot sender, so concurrent `push` calls
//! coalesce into a serialized sequence without blocking local work.
//!
//! Failure handling is two-tier:
//! - network, authentication, and local-store failures abort the whole
//!   push (remaining operations stay queued for a retry)
//! - per-item remote rejections (conflicts, validation errors) are
//!   recorded durably, the operation is discarded, and the push moves on

use std::sync::Arc;

use tablesync_types::{
    HandlerError, OperationKind, OperationState, PushFailure, PushStatus, SyncError,
    TableOperation, TableOperationError,
};
use tokio::sync::{mpsc, oneshot};

use crate::context::{item_key, Shared};

/// One queued push, answered when it terminates.
pub(crate) struct PushRequest {
    pub done: oneshot::Sender<Result<(), SyncError>>,
}

/// Consumer loop: runs until the context drops its sender side.
pub(crate) async fn run_consumer(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<PushRequest>) {
    while let Some(request) = rx.recv().await {
        let result = execute_push(&shared).await;
        // The caller may have given up; that cancels nothing.
        let _ = request.done.send(result);
    }
    tracing::debug!("push consumer stopped");
}

async fn execute_push(shared: &Shared) -> Result<(), SyncError> {
    // The operation write lock fences the snapshot: no enqueue is midway
    // between its durable write and its in-memory commit while the
    // bookmark is taken.
    let bookmark = {
        let _fence = shared.op_lock.write().await;
        shared.queue.lock().await.bookmark()
    };

    let status = drain_bookmark(shared, &bookmark).await;
    shared.queue.lock().await.unbookmark(&bookmark);

    let errors = match shared.errors.drain().await {
        Ok(errors) => errors,
        Err(error) => {
            tracing::error!(%error, "failed to drain push errors");
            return Err(SyncError::PushFailed(PushFailure {
                status: PushStatus::InternalError,
                errors: Vec::new(),
            }));
        }
    };

    if status == PushStatus::Complete && errors.is_empty() {
        Ok(())
    } else {
        tracing::warn!(%status, error_count = errors.len(), "push did not complete cleanly");
        Err(SyncError::PushFailed(PushFailure { status, errors }))
    }
}

async fn drain_bookmark(shared: &Shared, bookmark: &tablesync_core::Bookmark) -> PushStatus {
    loop {
        let next = shared.queue.lock().await.peek(bookmark);
        let Some(operation) = next else {
            return PushStatus::Complete;
        };
        if let Some(status) = push_one(shared, bookmark, operation).await {
            return status;
        }
    }
}

/// Push a single operation. Returns `Some(status)` to abort the push.
async fn push_one(
    shared: &Shared,
    bookmark: &tablesync_core::Bookmark,
    peeked: TableOperation,
) -> Option<PushStatus> {
    let _table = shared.table_locks.read(&peeked.table_name).await;
    let _id = shared
        .id_locks
        .acquire(&item_key(&peeked.table_name, &peeked.item_id))
        .await;

    // The operation may have coalesced or cancelled while we waited for
    // the item lock; re-read it under the lock.
    let current = {
        let queue = shared.queue.lock().await;
        queue
            .pending_for(&peeked.table_name, &peeked.item_id)
            .cloned()
    };
    let Some(operation) = current else {
        return None;
    };
    if operation.sequence >= bookmark.bound() {
        // Replaced by a newer operation outside this push's snapshot.
        return None;
    }

    let item = match operation.kind {
        OperationKind::Delete => operation.item.clone(),
        _ => match shared
            .store
            .lookup(&operation.table_name, &operation.item_id)
            .await
        {
            Ok(row) => row,
            Err(error) => {
                tracing::error!(%error, table = %operation.table_name, "push read failed");
                return Some(PushStatus::CancelledByLocalStoreError);
            }
        },
    };

    if shared
        .backups
        .save(&operation.table_name, &operation.item_id, item.as_ref())
        .await
        .is_err()
    {
        return Some(PushStatus::CancelledByLocalStoreError);
    }
    if shared
        .queue
        .lock()
        .await
        .set_state(operation.sequence, OperationState::Attempted)
        .await
        .is_err()
    {
        return Some(PushStatus::CancelledByLocalStoreError);
    }

    tracing::debug!(
        kind = %operation.kind,
        table = %operation.table_name,
        item_id = %operation.item_id,
        "pushing operation"
    );

    match shared.handler.execute(&operation, item.as_ref()).await {
        Ok(server_row) => {
            if operation.kind != OperationKind::Delete {
                if let Some(row) = server_row {
                    if shared
                        .store
                        .upsert(&operation.table_name, vec![row], true)
                        .await
                        .is_err()
                    {
                        return Some(PushStatus::CancelledByLocalStoreError);
                    }
                }
            }
            finish(shared, &operation).await
        }
        Err(HandlerError::Network(message)) => {
            tracing::warn!(%message, "push cancelled: remote unreachable");
            revert(shared, &operation).await;
            Some(PushStatus::CancelledByNetworkError)
        }
        Err(HandlerError::Unauthorized) => {
            revert(shared, &operation).await;
            Some(PushStatus::CancelledByAuthenticationError)
        }
        Err(HandlerError::PreconditionFailed { server_item }) => {
            record(shared, &operation, item, Some(412), None, server_item).await
        }
        Err(HandlerError::Http { status, body }) => {
            record(shared, &operation, item, Some(status), Some(body), None).await
        }
    }
}

/// Operation succeeded: drop it and its backup.
async fn finish(shared: &Shared, operation: &TableOperation) -> Option<PushStatus> {
    if shared.queue.lock().await.dequeue(operation).await.is_err() {
        return Some(PushStatus::CancelledByLocalStoreError);
    }
    if shared
        .backups
        .remove(&operation.table_name, &operation.item_id)
        .await
        .is_err()
    {
        return Some(PushStatus::CancelledByLocalStoreError);
    }
    None
}

/// Abort path: the operation stays queued for the next push.
async fn revert(shared: &Shared, operation: &TableOperation) {
    // Best effort; the push is aborting regardless.
    let _ = shared
        .queue
        .lock()
        .await
        .set_state(operation.sequence, OperationState::Pending)
        .await;
    let _ = shared
        .backups
        .remove(&operation.table_name, &operation.item_id)
        .await;
}

/// Permanent per-item failure: record it and move on.
async fn record(
    shared: &Shared,
    operation: &TableOperation,
    item: Option<serde_json::Value>,
    status: Option<u16>,
    raw_response: Option<String>,
    server_item: Option<serde_json::Value>,
) -> Option<PushStatus> {
    let client_item = match shared
        .backups
        .get(&operation.table_name, &operation.item_id)
        .await
    {
        Ok(backup) => backup.or(item),
        Err(_) => return Some(PushStatus::CancelledByLocalStoreError),
    };
    let error = TableOperationError::new(operation, client_item, status, raw_response, server_item);
    tracing::warn!(
        table = %operation.table_name,
        item_id = %operation.item_id,
        status = ?status,
        conflict = error.is_conflict(),
        "operation failed remotely"
    );
    if shared.errors.record(&error).await.is_err() {
        return Some(PushStatus::CancelledByLocalStoreError);
    }
    if shared
        .queue
        .lock()
        .await
        .set_state(operation.sequence, OperationState::Failed)
        .await
        .is_err()
    {
        return Some(PushStatus::CancelledByLocalStoreError);
    }
    finish(shared, operation).await
}
