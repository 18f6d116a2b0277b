//! Queued operations and push outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of a queued local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Insert a new row.
    Insert,
    /// Update an existing row.
    Update,
    /// Delete a row.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// The lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Waiting to be pushed.
    Pending,
    /// Handed to the remote handler; not yet resolved.
    Attempted,
    /// Permanently failed against the remote store.
    Failed,
}

/// One queued mutation against a single item.
///
/// At most one operation exists per `(table_name, item_id)` pair; later
/// local mutations on the same item coalesce into the existing operation
/// instead of appending.
///
/// The `item` payload is carried only by Delete operations (a snapshot of
/// the row taken before it was removed from the local store). Insert and
/// Update operations read the live row at push time, which is what makes
/// "insert then update pushes the latest payload" automatic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOperation {
    /// Durable row id of this operation.
    pub id: Uuid,
    /// Position in the queue's total order.
    pub sequence: i64,
    /// Normalized (lower-cased) table name.
    pub table_name: String,
    /// Target item id.
    pub item_id: String,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Lifecycle state.
    pub state: OperationState,
    /// Row snapshot; `Some` only for Delete operations.
    pub item: Option<Value>,
}

impl TableOperation {
    /// Create a new pending operation.
    pub fn new(
        kind: OperationKind,
        table_name: &str,
        item_id: &str,
        sequence: i64,
        item: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            table_name: table_name.to_string(),
            item_id: item_id.to_string(),
            kind,
            state: OperationState::Pending,
            item,
        }
    }
}

/// A permanently-failed-but-non-fatal operation, reported to the caller
/// as part of the push result batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOperationError {
    /// Durable row id of this error record.
    pub id: Uuid,
    /// Kind of the operation that failed.
    pub operation_kind: OperationKind,
    /// Table of the failed operation.
    pub table_name: String,
    /// Item id of the failed operation.
    pub item_id: String,
    /// Last known client-side item, from the local store or the item backup.
    pub client_item: Option<Value>,
    /// HTTP status of the remote failure, if any.
    pub status: Option<u16>,
    /// Raw server response body, if any.
    pub raw_response: Option<String>,
    /// The server's current item, populated for conflicts.
    pub server_item: Option<Value>,
}

impl TableOperationError {
    /// Create an error record for a failed operation.
    pub fn new(
        operation: &TableOperation,
        client_item: Option<Value>,
        status: Option<u16>,
        raw_response: Option<String>,
        server_item: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_kind: operation.kind,
            table_name: operation.table_name.clone(),
            item_id: operation.item_id.clone(),
            client_item,
            status,
            raw_response,
            server_item,
        }
    }

    /// Whether this error is an optimistic-concurrency conflict
    /// (remote precondition failure on a stale version token).
    pub fn is_conflict(&self) -> bool {
        self.status == Some(412)
    }
}

/// Terminal status of one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    /// The push drained its bookmark; individual operations may still
    /// have failed (see the error batch).
    Complete,
    /// Aborted early because the remote store was unreachable.
    CancelledByNetworkError,
    /// Aborted early because the remote store rejected the credentials.
    CancelledByAuthenticationError,
    /// Aborted early because the local store failed.
    CancelledByLocalStoreError,
    /// Aborted by an unexpected internal failure.
    InternalError,
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::CancelledByNetworkError => write!(f, "cancelled by network error"),
            Self::CancelledByAuthenticationError => {
                write!(f, "cancelled by authentication error")
            }
            Self::CancelledByLocalStoreError => write!(f, "cancelled by local store error"),
            Self::InternalError => write!(f, "internal error"),
        }
    }
}

/// The failure payload of an unsuccessful push: the terminal status plus
/// the batch of per-item errors accumulated before it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFailure {
    /// Terminal push status.
    pub status: PushStatus,
    /// Per-item errors recorded during the push.
    pub errors: Vec<TableOperationError>,
}

impl fmt::Display for PushFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} operation errors)", self.status, self.errors.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_row_roundtrip() {
        let op = TableOperation::new(
            OperationKind::Delete,
            "todo",
            "a",
            7,
            Some(json!({"id": "a", "title": "x"})),
        );
        let row = serde_json::to_value(&op).unwrap();
        assert!(row.get("id").unwrap().is_string());
        assert_eq!(row.get("tableName").unwrap(), "todo");
        assert_eq!(row.get("sequence").unwrap(), 7);

        let restored: TableOperation = serde_json::from_value(row).unwrap();
        assert_eq!(restored, op);
    }

    #[test]
    fn new_operations_start_pending() {
        let op = TableOperation::new(OperationKind::Insert, "todo", "a", 1, None);
        assert_eq!(op.state, OperationState::Pending);
        assert!(op.item.is_none());
    }

    #[test]
    fn conflict_detection_uses_precondition_status() {
        let op = TableOperation::new(OperationKind::Update, "todo", "a", 1, None);
        let conflict =
            TableOperationError::new(&op, None, Some(412), None, Some(json!({"id": "a"})));
        assert!(conflict.is_conflict());

        let bad_request = TableOperationError::new(&op, None, Some(400), None, None);
        assert!(!bad_request.is_conflict());
    }

    #[test]
    fn push_failure_display_counts_errors() {
        let op = TableOperation::new(OperationKind::Update, "todo", "a", 1, None);
        let failure = PushFailure {
            status: PushStatus::Complete,
            errors: vec![TableOperationError::new(&op, None, Some(404), None, None)],
        };
        assert_eq!(failure.to_string(), "complete (1 operation errors)");
    }

    #[test]
    fn operation_kind_display() {
        assert_eq!(OperationKind::Insert.to_string(), "insert");
        assert_eq!(OperationKind::Delete.to_string(), "delete");
    }
}
