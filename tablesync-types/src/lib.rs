//! # tablesync-types
//!
//! Domain types for the tablesync offline synchronization engine.
//!
//! This crate provides the foundational types used across all tablesync
//! crates:
//! - [`TableOperation`], [`OperationKind`], [`OperationState`] - queued local mutations
//! - [`TableOperationError`], [`PushStatus`], [`PushFailure`] - push outcomes
//! - [`Query`], [`Filter`], [`OrderBy`] - composable remote/local query expressions
//! - [`TableDefinition`], [`ColumnType`] - table schema
//! - [`SyncError`], [`StoreError`], [`HandlerError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod operations;
mod query;
mod table;

pub use error::{HandlerError, StoreError, SyncError};
pub use operations::{
    OperationKind, OperationState, PushFailure, PushStatus, TableOperation, TableOperationError,
};
pub use query::{compare_values, Filter, OrderBy, Query, SortOrder};
pub use table::{
    normalize_table_name, validate_item_id, ColumnDefinition, ColumnType, TableDefinition, sys,
    CONFIG_TABLE, ITEM_BACKUPS_TABLE, OPERATIONS_TABLE, SYNC_ERRORS_TABLE,
};
