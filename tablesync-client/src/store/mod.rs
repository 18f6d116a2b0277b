//! Local persistence.
//!
//! The engine owns *what* is stored (rows, the operation queue, backups,
//! delta tokens) but delegates *where* to a [`LocalStore`]
//! implementation. Stores persist schemaful JSON rows keyed by a string
//! `id` and evaluate the engine's [`Query`] expressions locally.
//!
//! [`MemoryStore`] is the reference implementation, suitable for tests
//! and ephemeral caches.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use tablesync_types::{Query, StoreError, TableDefinition};

/// Device-side storage backend.
///
/// All row payloads are JSON objects carrying a string `id` property.
/// Implementations must be safe for concurrent use; the engine serializes
/// conflicting access per table and per item above this trait, but
/// unrelated tables are accessed in parallel.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Prepare a table for use. Called for every user table and for the
    /// engine's system tables before any other access.
    ///
    /// Defining an existing table is a no-op (rows are retained).
    async fn define_table(&self, definition: TableDefinition) -> Result<(), StoreError>;

    /// Evaluate a query against a table.
    async fn read(&self, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Fetch a single row by id.
    async fn lookup(&self, table_name: &str, item_id: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace rows.
    ///
    /// `from_server` distinguishes pulled rows from local edits: a local
    /// edit that omits the `version` property must not clobber the
    /// version token already stored for the row, while server rows always
    /// replace wholesale.
    async fn upsert(
        &self,
        table_name: &str,
        rows: Vec<Value>,
        from_server: bool,
    ) -> Result<(), StoreError>;

    /// Delete rows by id. Missing ids are ignored.
    async fn delete_ids(&self, table_name: &str, item_ids: &[String]) -> Result<(), StoreError>;

    /// Delete all rows matching a query, returning how many were removed.
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError>;
}
