//! Table schema and naming rules.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// System table holding the durable operation queue.
pub const OPERATIONS_TABLE: &str = "__operations";
/// System table holding pre-push item backups.
pub const ITEM_BACKUPS_TABLE: &str = "__item_backups";
/// System table holding per-item push errors until the push completes.
pub const SYNC_ERRORS_TABLE: &str = "__sync_errors";
/// System table holding engine settings such as incremental pull checkpoints.
pub const CONFIG_TABLE: &str = "__config";

/// Well-known row property names.
pub mod sys {
    /// String primary key, present on every row.
    pub const ID: &str = "id";
    /// Opaque server version token (ETag) used for optimistic concurrency.
    pub const VERSION: &str = "version";
    /// Server-maintained modification timestamp, drives incremental pull.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Soft-delete marker on pulled rows.
    pub const DELETED: &str = "deleted";
}

/// Column types a local store must be able to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// 64-bit integer.
    Integer,
    /// 64-bit float.
    Real,
    /// Boolean.
    Boolean,
    /// Date/time, stored in the backend's native representation.
    Date,
    /// Structured JSON value.
    Json,
    /// An arbitrary serialized value the store treats as opaque.
    ///
    /// Backs the payload columns of the operation queue and item-backup
    /// tables, so any store implementation can persist them without
    /// understanding their contents.
    Other,
}

/// A single column in a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

impl ColumnDefinition {
    /// Create a column definition.
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
        }
    }
}

/// Schema for one table, passed to [`define_table`].
///
/// Every table has an implicit `id: String` primary key; it does not need
/// to be listed in `columns`.
///
/// [`define_table`]: https://docs.rs/tablesync-client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Normalized (lower-cased) table name.
    pub name: String,
    /// Column definitions.
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// Create a table definition. The name is normalized to lower case.
    pub fn new(name: &str, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            columns,
        }
    }
}

/// Maximum length of an item id, matching common remote table services.
const MAX_ITEM_ID_LEN: usize = 255;

/// Validate a caller-supplied item id.
///
/// Ids must be non-empty strings of at most 255 characters, must not be
/// `"."` or `".."`, and must not contain control characters.
pub fn validate_item_id(item_id: &str) -> Result<(), SyncError> {
    let invalid = item_id.is_empty()
        || item_id.len() > MAX_ITEM_ID_LEN
        || item_id == "."
        || item_id == ".."
        || item_id.chars().any(|c| c.is_control());
    if invalid {
        return Err(SyncError::InvalidItemId(item_id.to_string()));
    }
    Ok(())
}

/// Normalize a table name: trim and lower-case.
///
/// Empty names are rejected. Names beginning with `__` are reserved for
/// the engine's system tables and rejected for caller operations.
pub fn normalize_table_name(table_name: &str) -> Result<String, SyncError> {
    let normalized = table_name.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(SyncError::InvalidTableName(table_name.to_string()));
    }
    if normalized.starts_with("__") {
        return Err(SyncError::ReservedTable(normalized));
    }
    Ok(normalized)
}
