//! In-memory reference store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tablesync_types::{
    compare_values, sys, Query, SortOrder, StoreError, TableDefinition,
};

use super::LocalStore;

#[derive(Default)]
struct Table {
    rows: BTreeMap<String, Value>,
}

#[derive(Default)]
struct Faults {
    lookup: Option<String>,
    upsert: Option<String>,
    delete: Option<String>,
    read: Option<String>,
}

/// A [`LocalStore`] kept entirely in memory.
///
/// The reference implementation: tests run against it, and it documents
/// the row semantics (id keying, version preservation, query evaluation)
/// a durable store must reproduce. Supports injecting one-shot failures
/// for exercising store-error paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a table synchronously (convenience for setup code).
    pub fn define(&self, definition: TableDefinition) {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(definition.name).or_default();
    }

    /// Fail the next `lookup` call with an I/O error.
    pub fn fail_next_lookup(&self, message: &str) {
        self.faults.lock().unwrap().lookup = Some(message.to_string());
    }

    /// Fail the next `upsert` call with an I/O error.
    pub fn fail_next_upsert(&self, message: &str) {
        self.faults.lock().unwrap().upsert = Some(message.to_string());
    }

    /// Fail the next `delete_ids` or `delete_by_query` call with an I/O
    /// error.
    pub fn fail_next_delete(&self, message: &str) {
        self.faults.lock().unwrap().delete = Some(message.to_string());
    }

    /// Fail the next `read` call with an I/O error.
    pub fn fail_next_read(&self, message: &str) {
        self.faults.lock().unwrap().read = Some(message.to_string());
    }

    /// Total rows in a table (test observability). Zero for undefined
    /// tables.
    pub fn row_count(&self, table_name: &str) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.get(table_name).map_or(0, |t| t.rows.len())
    }

    fn trip(fault: &mut Option<String>) -> Result<(), StoreError> {
        match fault.take() {
            Some(message) => Err(StoreError::Io(message)),
            None => Ok(()),
        }
    }
}

fn row_id(row: &Value) -> Result<String, StoreError> {
    let id = row
        .get(sys::ID)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidRow(format!("row without a string id: {row}")))?;
    Ok(id.to_string())
}

fn sort_rows(rows: &mut [Value], query: &Query) {
    rows.sort_by(|a, b| {
        for clause in query.order() {
            let ordering = match (a.get(&clause.field), b.get(&clause.field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = match clause.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(row: &Value, select: &[String]) -> Value {
    if select.is_empty() {
        return row.clone();
    }
    let mut out = Map::new();
    for field in select {
        if let Some(value) = row.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn define_table(&self, definition: TableDefinition) -> Result<(), StoreError> {
        self.define(definition);
        Ok(())
    }

    async fn read(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        Self::trip(&mut self.faults.lock().unwrap().read)?;
        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(query.table_name())
            .ok_or_else(|| StoreError::UndefinedTable(query.table_name().to_string()))?;

        let mut rows: Vec<Value> = table
            .rows
            .values()
            .filter(|row| query.filter().map_or(true, |f| f.matches(row)))
            .cloned()
            .collect();
        sort_rows(&mut rows, query);

        let skip = query.skip().unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(skip);
        let rows: Vec<Value> = match query.top() {
            Some(top) => rows.take(top as usize).collect(),
            None => rows.collect(),
        };
        Ok(rows
            .iter()
            .map(|row| project(row, query.select()))
            .collect())
    }

    async fn lookup(&self, table_name: &str, item_id: &str) -> Result<Option<Value>, StoreError> {
        Self::trip(&mut self.faults.lock().unwrap().lookup)?;
        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(table_name)
            .ok_or_else(|| StoreError::UndefinedTable(table_name.to_string()))?;
        Ok(table.rows.get(item_id).cloned())
    }

    async fn upsert(
        &self,
        table_name: &str,
        rows: Vec<Value>,
        from_server: bool,
    ) -> Result<(), StoreError> {
        Self::trip(&mut self.faults.lock().unwrap().upsert)?;
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| StoreError::UndefinedTable(table_name.to_string()))?;

        for mut row in rows {
            if !row.is_object() {
                return Err(StoreError::InvalidRow(format!("row is not an object: {row}")));
            }
            let id = row_id(&row)?;
            if !from_server {
                // Local edits that omit the version token keep the one
                // already stored, so a later push can still send it.
                if row.get(sys::VERSION).is_none() {
                    if let Some(version) =
                        table.rows.get(&id).and_then(|existing| existing.get(sys::VERSION))
                    {
                        row[sys::VERSION] = version.clone();
                    }
                }
            }
            table.rows.insert(id, row);
        }
        Ok(())
    }

    async fn delete_ids(&self, table_name: &str, item_ids: &[String]) -> Result<(), StoreError> {
        Self::trip(&mut self.faults.lock().unwrap().delete)?;
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| StoreError::UndefinedTable(table_name.to_string()))?;
        for id in item_ids {
            table.rows.remove(id);
        }
        Ok(())
    }

    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        Self::trip(&mut self.faults.lock().unwrap().delete)?;
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(query.table_name())
            .ok_or_else(|| StoreError::UndefinedTable(query.table_name().to_string()))?;

        // Same evaluation as `read`: the ordered, paged result set is
        // what gets deleted.
        let mut rows: Vec<Value> = table
            .rows
            .values()
            .filter(|row| query.filter().map_or(true, |f| f.matches(row)))
            .cloned()
            .collect();
        sort_rows(&mut rows, query);

        let skip = query.skip().unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(skip);
        let doomed: Vec<String> = match query.top() {
            Some(top) => rows
                .take(top as usize)
                .map(|row| row_id(&row))
                .collect::<Result<_, _>>()?,
            None => rows.map(|row| row_id(&row)).collect::<Result<_, _>>()?,
        };
        for id in &doomed {
            table.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tablesync_types::Filter;

    async fn store_with(table: &str, rows: &[Value]) -> MemoryStore {
        let store = MemoryStore::new();
        store.define(TableDefinition::new(table, vec![]));
        store.upsert(table, rows.to_vec(), true).await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_and_lookup_roundtrip() {
        let store = MemoryStore::new();
        store.define(TableDefinition::new("todo", vec![]));
        store
            .upsert("todo", vec![json!({"id": "a", "title": "x"})], false)
            .await
            .unwrap();

        let row = store.lookup("todo", "a").await.unwrap().unwrap();
        assert_eq!(row["title"], "x");
        assert!(store.lookup("todo", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undefined_table_is_an_error() {
        let store = MemoryStore::new();
        let err = store.lookup("nope", "a").await.unwrap_err();
        assert!(matches!(err, StoreError::UndefinedTable(_)));
    }

    #[tokio::test]
    async fn rows_without_string_ids_are_rejected() {
        let store = MemoryStore::new();
        store.define(TableDefinition::new("todo", vec![]));
        let err = store
            .upsert("todo", vec![json!({"title": "no id"})], false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));

        let err = store
            .upsert("todo", vec![json!({"id": 7})], false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));
    }

    #[tokio::test]
    async fn local_upsert_preserves_stored_version() {
        let store = MemoryStore::new();
        store.define(TableDefinition::new("todo", vec![]));
        store
            .upsert(
                "todo",
                vec![json!({"id": "a", "title": "x", "version": "v1"})],
                true,
            )
            .await
            .unwrap();

        // A local edit without a version keeps v1.
        store
            .upsert("todo", vec![json!({"id": "a", "title": "y"})], false)
            .await
            .unwrap();
        let row = store.lookup("todo", "a").await.unwrap().unwrap();
        assert_eq!(row["title"], "y");
        assert_eq!(row["version"], "v1");

        // A server row replaces wholesale.
        store
            .upsert("todo", vec![json!({"id": "a", "title": "z"})], true)
            .await
            .unwrap();
        let row = store.lookup("todo", "a").await.unwrap().unwrap();
        assert!(row.get("version").is_none());
    }

    #[tokio::test]
    async fn read_applies_filter_order_and_paging() {
        let store = store_with(
            "todo",
            &[
                json!({"id": "a", "rank": 3, "done": false}),
                json!({"id": "b", "rank": 1, "done": false}),
                json!({"id": "c", "rank": 2, "done": true}),
                json!({"id": "d", "rank": 4, "done": false}),
            ],
        ).await;

        let query = Query::table("todo")
            .with_filter(Filter::Eq("done".into(), json!(false)))
            .order_by("rank", SortOrder::Ascending)
            .with_skip(1)
            .with_top(1);
        let rows = store.read(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "a");
    }

    #[tokio::test]
    async fn read_descending_order() {
        let store = store_with(
            "todo",
            &[json!({"id": "a", "rank": 1}), json!({"id": "b", "rank": 2})],
        ).await;
        let query = Query::table("todo").order_by("rank", SortOrder::Descending);
        let rows = store.read(&query).await.unwrap();
        assert_eq!(rows[0]["id"], "b");
    }

    #[tokio::test]
    async fn read_projects_selected_fields() {
        let store = store_with("todo", &[json!({"id": "a", "title": "x", "rank": 1})]).await;
        let query = Query::table("todo").with_select(vec!["id".into(), "title".into()]);
        let rows = store.read(&query).await.unwrap();
        assert_eq!(rows[0], json!({"id": "a", "title": "x"}));
    }

    #[tokio::test]
    async fn delete_by_query_counts_removed_rows() {
        let store = store_with(
            "todo",
            &[
                json!({"id": "a", "done": true}),
                json!({"id": "b", "done": false}),
                json!({"id": "c", "done": true}),
            ],
        ).await;
        let removed = store
            .delete_by_query(&Query::table("todo").with_filter(Filter::Eq("done".into(), json!(true))))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.row_count("todo"), 1);
    }

    #[tokio::test]
    async fn delete_by_query_honors_order_and_paging() {
        let store = store_with(
            "todo",
            &[
                json!({"id": "a", "rank": 3}),
                json!({"id": "b", "rank": 1}),
                json!({"id": "c", "rank": 2}),
            ],
        ).await;
        let removed = store
            .delete_by_query(
                &Query::table("todo")
                    .order_by("rank", SortOrder::Ascending)
                    .with_skip(1)
                    .with_top(1),
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        // Only the second row by rank was removed.
        assert!(store.lookup("todo", "c").await.unwrap().is_none());
        assert!(store.lookup("todo", "a").await.unwrap().is_some());
        assert!(store.lookup("todo", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_by_query_without_filter_clears_the_table() {
        let store = store_with("todo", &[json!({"id": "a"}), json!({"id": "b"})]).await;
        let removed = store.delete_by_query(&Query::table("todo")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.row_count("todo"), 0);
    }

    #[tokio::test]
    async fn delete_ids_ignores_missing() {
        let store = store_with("todo", &[json!({"id": "a"})]).await;
        store
            .delete_ids("todo", &["a".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(store.row_count("todo"), 0);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = store_with("todo", &[json!({"id": "a"})]).await;
        store.fail_next_lookup("disk gone");
        let err = store.lookup("todo", "a").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.lookup("todo", "a").await.is_ok());
    }
}
