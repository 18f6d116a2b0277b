//! Error types for tablesync.

use serde_json::Value;
use thiserror::Error;

use crate::operations::PushFailure;

/// Errors raised by local store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying persistence I/O failed.
    #[error("store I/O error: {0}")]
    Io(String),

    /// The table has not been defined.
    #[error("table not defined: {0}")]
    UndefinedTable(String),

    /// A row was malformed (missing or non-string id, not an object).
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Row serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the remote sync handler for a single operation or
/// query.
///
/// The push loop classifies these: `Network` and `Unauthorized` abort the
/// push; `PreconditionFailed` and `Http` are recorded per item and the
/// push continues.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transport failure reaching the remote store.
    #[error("network error: {0}")]
    Network(String),

    /// The remote store rejected the credentials (HTTP 401).
    #[error("authentication failed")]
    Unauthorized,

    /// Optimistic-concurrency conflict (HTTP 412): the version token sent
    /// with an update or delete was stale.
    #[error("precondition failed")]
    PreconditionFailed {
        /// The server's current item, when the response carried one.
        server_item: Option<Value>,
    },

    /// Any other remote rejection.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
}

/// Caller-facing errors of the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation was attempted before `initialize` completed.
    #[error("sync context is not initialized")]
    NotInitialized,

    /// The supplied item id is not a valid string id.
    #[error("invalid item id: {0:?}")]
    InvalidItemId(String),

    /// The supplied table name is empty or malformed.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The supplied table name is reserved for engine system tables.
    #[error("table name is reserved: {0}")]
    ReservedTable(String),

    /// The supplied item is not a JSON object.
    #[error("item must be a JSON object: {0}")]
    InvalidItem(String),

    /// Insert against an id that already has a local row.
    #[error("an item with id {item_id:?} already exists in table {table}")]
    ItemAlreadyExists {
        /// Target table.
        table: String,
        /// Conflicting item id.
        item_id: String,
    },

    /// Update against an id with a pending delete in the queue.
    #[error("item {table}/{item_id} has a pending delete and cannot be updated")]
    PendingDelete {
        /// Target table.
        table: String,
        /// Target item id.
        item_id: String,
    },

    /// Enqueue against an id whose pending operation does not admit the
    /// new mutation (caller bug, e.g. insert over a pending insert).
    #[error("item {table}/{item_id} already has a pending operation")]
    PendingOperation {
        /// Target table.
        table: String,
        /// Target item id.
        item_id: String,
    },

    /// Purge requested on a table with pending operations.
    #[error("table {table} has pending operations and cannot be purged")]
    PurgePending {
        /// Target table.
        table: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// The remote handler failed outside a push (e.g. during a pull).
    #[error("remote operation failed: {0}")]
    Remote(#[from] HandlerError),

    /// The push terminated with a failure status and/or per-item errors.
    #[error("push failed: {0}")]
    PushFailed(PushFailure),

    /// The push consumer shut down before completing the request
    /// (the context was re-initialized out from under the caller).
    #[error("push aborted by shutdown")]
    PushAborted,
}
