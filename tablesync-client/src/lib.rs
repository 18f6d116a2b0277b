//! # tablesync-client
//!
//! Offline table synchronization engine.
//!
//! Applications read and mutate JSON rows in a local store while offline;
//! every local mutation is recorded in a durable operation queue. A
//! [`SyncContext`] later *pushes* the queue to a remote table service
//! through a pluggable [`SyncHandler`] and *pulls* remote changes back
//! into the local store, incrementally where possible.
//!
//! ## Architecture
//!
//! ```text
//! application
//!     |  insert / update / delete / read
//! SyncContext ---- operation queue (tablesync-core, durable mirror here)
//!     |  push / pull
//! SyncHandler ---- remote table service
//!     |
//! LocalStore  ---- device persistence (MemoryStore provided)
//! ```
//!
//! Local mutations to the same item coalesce into at most one queued
//! operation, so a burst of edits costs one remote call. Pushes run on a
//! single consumer task over a bookmarked snapshot of the queue; callers
//! await completion through a one-shot channel, so concurrent `push`
//! calls serialize without blocking local reads and writes.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tablesync_client::{MemoryStore, MockSyncHandler, SyncContext, SyncSettings};
//! use tablesync_types::{ColumnDefinition, ColumnType, TableDefinition};
//!
//! # async fn run() -> Result<(), tablesync_types::SyncError> {
//! let store = Arc::new(MemoryStore::new());
//! store.define(TableDefinition::new(
//!     "todo",
//!     vec![ColumnDefinition::new("title", ColumnType::String)],
//! ));
//!
//! let context = SyncContext::new(SyncSettings::default());
//! context
//!     .initialize(store, Arc::new(MockSyncHandler::new()))
//!     .await?;
//!
//! context
//!     .insert("todo", "a", json!({"id": "a", "title": "buy milk"}))
//!     .await?;
//! context.push().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod context;
mod handler;
mod locks;
mod pull;
mod push;
mod queue;
mod store;

pub use context::{SyncContext, SyncSettings};
pub use handler::{MockSyncHandler, SyncHandler};
pub use locks::{KeyedMutexes, KeyedRwLocks};
pub use store::{LocalStore, MemoryStore};
