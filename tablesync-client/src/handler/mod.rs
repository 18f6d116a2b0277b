//! Remote table service access.
//!
//! The engine never talks HTTP itself; it hands each queued operation and
//! each pull query to a [`SyncHandler`]. Implementations wrap whatever
//! transport the application uses and map its failures onto
//! [`HandlerError`], which is what drives the push loop's
//! abort-versus-record decisions.
//!
//! A handler is also the natural seam for application policy: conflict
//! resolution by retrying [`execute`](SyncHandler::execute) with merged
//! payloads, request decoration, or capturing traffic in tests with
//! [`MockSyncHandler`].

mod mock;

pub use mock::MockSyncHandler;

use async_trait::async_trait;
use serde_json::Value;
use tablesync_types::{HandlerError, Query, TableOperation};

/// Remote executor for queued operations and pull queries.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Execute one queued operation against the remote table.
    ///
    /// `item` is the payload to send: the live local row for inserts and
    /// updates, the pre-delete snapshot for deletes. The returned value,
    /// if any, is the server's authoritative row and replaces the local
    /// one (deletes return `None`).
    async fn execute(
        &self,
        operation: &TableOperation,
        item: Option<&Value>,
    ) -> Result<Option<Value>, HandlerError>;

    /// Fetch one page of rows for a pull query.
    async fn read(&self, query: &Query) -> Result<Vec<Value>, HandlerError>;
}
