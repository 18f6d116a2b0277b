//! Pulling remote changes into the local store.
//!
//! A pull pages through the remote query (planned by
//! `tablesync_core::PullPlan`) and applies each page row by row under the
//! item lock. Rows with a pending local operation are skipped: the local
//! edit wins until it has been pushed, at which point the next pull picks
//! up the server's authoritative copy. Rows flagged `deleted` are removed
//! locally.
//!
//! Incremental pulls persist their high-water `updatedAt` token in the
//! `__config` table after every page, keyed by `(table, query id)`, so an
//! interrupted pull resumes where it left off and re-applying a page is
//! harmless.

use serde_json::{json, Value};
use tablesync_core::{PageOutcome, PullPlan};
use tablesync_types::{sys, Query, StoreError, SyncError, CONFIG_TABLE};

use crate::context::{item_key, Shared};

fn token_key(table_name: &str, query_id: &str) -> String {
    format!("deltaToken|{table_name}|{query_id}")
}

async fn load_token(
    shared: &Shared,
    table_name: &str,
    query_id: &str,
) -> Result<Option<Value>, SyncError> {
    let row = shared
        .store
        .lookup(CONFIG_TABLE, &token_key(table_name, query_id))
        .await?;
    Ok(row
        .and_then(|r| r.get("value").cloned())
        .filter(|v| !v.is_null()))
}

async fn save_token(
    shared: &Shared,
    table_name: &str,
    query_id: &str,
    token: &Value,
) -> Result<(), SyncError> {
    let row = json!({
        "id": token_key(table_name, query_id),
        "tableName": table_name,
        "value": token,
    });
    shared.store.upsert(CONFIG_TABLE, vec![row], true).await?;
    Ok(())
}

/// Page through the remote query and fold the results into the store.
pub(crate) async fn execute_pull(
    shared: &Shared,
    query: Query,
    query_id: Option<&str>,
) -> Result<(), SyncError> {
    let table = query.table_name().to_string();
    let mut plan = match query_id {
        Some(query_id) => {
            let token = load_token(shared, &table, query_id).await?;
            tracing::debug!(%table, query_id, token = ?token, "starting incremental pull");
            PullPlan::incremental(query, shared.page_size, token)
        }
        None => PullPlan::plain(query, shared.page_size),
    };

    loop {
        let page = shared.handler.read(&plan.next_query()).await?;
        apply_page(shared, &table, &page).await?;
        match plan.advance(&page) {
            PageOutcome::Done => break,
            PageOutcome::Continue { delta_token } => {
                if let (Some(query_id), Some(token)) = (query_id, delta_token) {
                    save_token(shared, &table, query_id, &token).await?;
                }
            }
        }
    }
    Ok(())
}

async fn apply_page(shared: &Shared, table: &str, rows: &[Value]) -> Result<(), SyncError> {
    let _table = shared.table_locks.read(table).await;
    for row in rows {
        let Some(item_id) = row.get(sys::ID).and_then(Value::as_str) else {
            return Err(
                StoreError::InvalidRow(format!("pulled row without a string id: {row}")).into(),
            );
        };
        let _id = shared.id_locks.acquire(&item_key(table, item_id)).await;

        // Unpushed local edits shadow the server copy.
        if shared
            .queue
            .lock()
            .await
            .pending_for(table, item_id)
            .is_some()
        {
            tracing::debug!(%table, item_id, "pull skipping item with pending operation");
            continue;
        }

        let deleted = row
            .get(sys::DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if deleted {
            shared.store.delete_ids(table, &[item_id.to_string()]).await?;
        } else {
            shared.store.upsert(table, vec![row.clone()], true).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tablesync_types::{OperationKind, TableDefinition, ITEM_BACKUPS_TABLE, OPERATIONS_TABLE, SYNC_ERRORS_TABLE};
    use tokio::sync::{Mutex, RwLock};

    use crate::handler::MockSyncHandler;
    use crate::locks::{KeyedMutexes, KeyedRwLocks};
    use crate::queue::{DurableQueue, ErrorLog, ItemBackups};
    use crate::store::{LocalStore, MemoryStore};

    async fn shared_over(store: Arc<MemoryStore>) -> Arc<Shared> {
        for table in [
            OPERATIONS_TABLE,
            ITEM_BACKUPS_TABLE,
            SYNC_ERRORS_TABLE,
            CONFIG_TABLE,
        ] {
            store.define(TableDefinition::new(table, vec![]));
        }
        let store: Arc<dyn LocalStore> = store;
        let queue = DurableQueue::load(store.clone()).await.unwrap();
        Arc::new(Shared {
            store: store.clone(),
            handler: Arc::new(MockSyncHandler::new()),
            op_lock: RwLock::new(()),
            table_locks: KeyedRwLocks::new(),
            id_locks: KeyedMutexes::new(),
            queue: Mutex::new(queue),
            backups: ItemBackups::new(store.clone()),
            errors: ErrorLog::new(store),
            page_size: 50,
        })
    }

    #[tokio::test]
    async fn apply_page_skips_items_with_pending_operations() {
        let store = Arc::new(MemoryStore::new());
        store.define(TableDefinition::new("todo", vec![]));
        let shared = shared_over(store.clone()).await;
        shared
            .queue
            .lock()
            .await
            .enqueue(OperationKind::Delete, "todo", "a", None)
            .await
            .unwrap();

        let page = vec![
            json!({"id": "a", "title": "server"}),
            json!({"id": "b", "title": "server"}),
        ];
        apply_page(&shared, "todo", &page).await.unwrap();

        // The pending delete shadows the server's copy of "a".
        assert!(shared.store.lookup("todo", "a").await.unwrap().is_none());
        assert!(shared.store.lookup("todo", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn apply_page_rejects_rows_without_ids() {
        let store = Arc::new(MemoryStore::new());
        store.define(TableDefinition::new("todo", vec![]));
        let shared = shared_over(store).await;

        let page = vec![json!({"title": "anonymous"})];
        let err = apply_page(&shared, "todo", &page).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(StoreError::InvalidRow(_))
        ));
    }

    #[tokio::test]
    async fn delta_tokens_roundtrip_per_query_id() {
        let store = Arc::new(MemoryStore::new());
        let shared = shared_over(store).await;

        assert_eq!(load_token(&shared, "todo", "all").await.unwrap(), None);
        save_token(&shared, "todo", "all", &json!("t5")).await.unwrap();
        assert_eq!(
            load_token(&shared, "todo", "all").await.unwrap(),
            Some(json!("t5"))
        );
        // Other query ids keep their own checkpoint.
        assert_eq!(load_token(&shared, "todo", "mine").await.unwrap(), None);
    }
}
