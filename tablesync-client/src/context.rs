//! The synchronization context.
//!
//! [`SyncContext`] is the application-facing handle: local CRUD that
//! records operations, plus `push`, `pull`, and `purge`. One context owns
//! one local store, one remote handler, and one push consumer task.
//!
//! ## Locking
//!
//! Four levels, always acquired in this order:
//! 1. the session lock (initialization versus everything else)
//! 2. the operation lock (shared by mutations, exclusive while a push
//!    snapshots the queue)
//! 3. the table lock (shared by row work, exclusive for purge)
//! 4. the item lock (exclusive per `(table, item id)`)
//!
//! The queue mutex nests innermost and is never held across a remote
//! call.

use serde_json::{json, Value};
use std::sync::Arc;
use tablesync_types::{
    normalize_table_name, sys, validate_item_id, ColumnDefinition, ColumnType, Filter,
    OperationKind, Query, SyncError, TableDefinition, CONFIG_TABLE, ITEM_BACKUPS_TABLE,
    OPERATIONS_TABLE, SYNC_ERRORS_TABLE,
};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;

use crate::handler::SyncHandler;
use crate::locks::{KeyedMutexes, KeyedRwLocks};
use crate::pull::execute_pull;
use crate::push::{run_consumer, PushRequest};
use crate::queue::{DurableQueue, ErrorLog, ItemBackups};
use crate::store::LocalStore;

/// Key of the per-item lock for one row.
pub(crate) fn item_key(table_name: &str, item_id: &str) -> String {
    format!("{table_name}/{item_id}")
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Rows requested per page during pulls.
    pub page_size: u32,
}

impl SyncSettings {
    /// Set the pull page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// State shared between the context and its push consumer.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) handler: Arc<dyn SyncHandler>,
    pub(crate) op_lock: RwLock<()>,
    pub(crate) table_locks: KeyedRwLocks,
    pub(crate) id_locks: KeyedMutexes,
    pub(crate) queue: Mutex<DurableQueue>,
    pub(crate) backups: ItemBackups,
    pub(crate) errors: ErrorLog,
    pub(crate) page_size: u32,
}

struct Session {
    shared: Arc<Shared>,
    push_tx: mpsc::UnboundedSender<PushRequest>,
    consumer: JoinHandle<()>,
}

/// Read hold on the live session, kept for an operation's whole run so
/// `initialize` cannot swap the session underneath it.
type SessionGuard = OwnedRwLockReadGuard<Option<Session>, Session>;

/// The offline synchronization engine.
///
/// Create one per local store, [`initialize`](Self::initialize) it, then
/// use the CRUD and sync operations from any number of tasks; the context
/// is internally synchronized.
pub struct SyncContext {
    settings: SyncSettings,
    session: Arc<RwLock<Option<Session>>>,
}

impl SyncContext {
    /// Create an uninitialized context.
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Bind the context to a store and a remote handler.
    ///
    /// Defines the engine's system tables, restores any operation queue
    /// left behind by a previous run, and starts the push consumer.
    /// Re-initializing first waits for operations in flight on the old
    /// session and drains pushes already queued against it.
    pub async fn initialize(
        &self,
        store: Arc<dyn LocalStore>,
        handler: Arc<dyn SyncHandler>,
    ) -> Result<(), SyncError> {
        let mut slot = self.session.write().await;
        if let Some(session) = slot.take() {
            let Session {
                shared: _,
                push_tx,
                consumer,
            } = session;
            // Closing the channel lets the consumer finish queued pushes
            // and stop.
            drop(push_tx);
            let _ = consumer.await;
        }

        for definition in system_tables() {
            store.define_table(definition).await?;
        }
        // Error records belong to the push that produced them; any left
        // over from an interrupted run must not surface in this session's
        // push results.
        store
            .delete_by_query(&Query::table(SYNC_ERRORS_TABLE))
            .await?;
        let queue = DurableQueue::load(store.clone()).await?;

        let shared = Arc::new(Shared {
            store: store.clone(),
            handler,
            op_lock: RwLock::new(()),
            table_locks: KeyedRwLocks::new(),
            id_locks: KeyedMutexes::new(),
            queue: Mutex::new(queue),
            backups: ItemBackups::new(store.clone()),
            errors: ErrorLog::new(store),
            page_size: self.settings.page_size,
        });
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(run_consumer(shared.clone(), push_rx));

        *slot = Some(Session {
            shared,
            push_tx,
            consumer,
        });
        tracing::info!("sync context initialized");
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub async fn is_initialized(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn session_guard(&self) -> Result<SessionGuard, SyncError> {
        let slot = self.session.clone().read_owned().await;
        OwnedRwLockReadGuard::try_map(slot, Option::as_ref).map_err(|_| SyncError::NotInitialized)
    }

    /// Define a user table on the underlying store.
    pub async fn define_table(&self, definition: TableDefinition) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        let name = normalize_table_name(&definition.name)?;
        session
            .shared
            .store
            .define_table(TableDefinition::new(&name, definition.columns))
            .await?;
        Ok(())
    }

    /// Number of queued operations, for one table or overall.
    pub async fn pending_operations(&self, table_name: Option<&str>) -> Result<u64, SyncError> {
        let session = self.session_guard().await?;
        let table = table_name.map(normalize_table_name).transpose()?;
        let count = session.shared.queue.lock().await.count(table.as_deref());
        Ok(count)
    }

    /// Insert an item locally and queue it for push.
    ///
    /// The item's `id` property is set to `item_id`. Fails if a row with
    /// that id already exists.
    pub async fn insert(
        &self,
        table_name: &str,
        item_id: &str,
        item: Value,
    ) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(table_name)?;
        validate_item_id(item_id)?;
        let item = with_id(item, item_id)?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.read(&table).await;
        let _id = shared.id_locks.acquire(&item_key(&table, item_id)).await;

        if shared.store.lookup(&table, item_id).await?.is_some() {
            return Err(SyncError::ItemAlreadyExists {
                table,
                item_id: item_id.to_string(),
            });
        }
        shared.store.upsert(&table, vec![item], false).await?;
        let enqueued = shared
            .queue
            .lock()
            .await
            .enqueue(OperationKind::Insert, &table, item_id, None)
            .await;
        if let Err(error) = enqueued {
            // Roll the row back; the mutation was never recorded.
            let _ = shared.store.delete_ids(&table, &[item_id.to_string()]).await;
            return Err(error);
        }
        tracing::debug!(%table, item_id, "inserted");
        Ok(())
    }

    /// Update an item locally and queue the change for push.
    pub async fn update(
        &self,
        table_name: &str,
        item_id: &str,
        item: Value,
    ) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(table_name)?;
        validate_item_id(item_id)?;
        let item = with_id(item, item_id)?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.read(&table).await;
        let _id = shared.id_locks.acquire(&item_key(&table, item_id)).await;

        let previous = shared.store.lookup(&table, item_id).await?;
        shared.store.upsert(&table, vec![item], false).await?;
        let enqueued = shared
            .queue
            .lock()
            .await
            .enqueue(OperationKind::Update, &table, item_id, None)
            .await;
        if let Err(error) = enqueued {
            match previous {
                Some(row) => {
                    let _ = shared.store.upsert(&table, vec![row], true).await;
                }
                None => {
                    let _ = shared.store.delete_ids(&table, &[item_id.to_string()]).await;
                }
            }
            return Err(error);
        }
        tracing::debug!(%table, item_id, "updated");
        Ok(())
    }

    /// Delete an item locally and queue the deletion for push.
    ///
    /// Deleting an id with no local row still queues a remote delete.
    pub async fn delete(&self, table_name: &str, item_id: &str) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(table_name)?;
        validate_item_id(item_id)?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.read(&table).await;
        let _id = shared.id_locks.acquire(&item_key(&table, item_id)).await;

        // Snapshot before removal: the push sends this payload and error
        // reports cite it.
        let snapshot = shared.store.lookup(&table, item_id).await?;
        shared.store.delete_ids(&table, &[item_id.to_string()]).await?;
        let enqueued = shared
            .queue
            .lock()
            .await
            .enqueue(OperationKind::Delete, &table, item_id, snapshot.clone())
            .await;
        if let Err(error) = enqueued {
            if let Some(row) = snapshot {
                let _ = shared.store.upsert(&table, vec![row], true).await;
            }
            return Err(error);
        }
        tracing::debug!(%table, item_id, "deleted");
        Ok(())
    }

    /// Evaluate a query against the local store.
    pub async fn read(&self, query: &Query) -> Result<Vec<Value>, SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(query.table_name())?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.read(&table).await;
        Ok(shared.store.read(query).await?)
    }

    /// Fetch a single local row by id.
    pub async fn look_up(
        &self,
        table_name: &str,
        item_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(table_name)?;
        validate_item_id(item_id)?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.read(&table).await;
        Ok(shared.store.lookup(&table, item_id).await?)
    }

    /// Push all queued operations to the remote store.
    ///
    /// Operations are sent oldest-first. Per-item remote rejections are
    /// collected into [`SyncError::PushFailed`]; network, authentication,
    /// and local-store failures abort the push with the remaining
    /// operations still queued.
    pub async fn push(&self) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        Self::request_push(&session.push_tx).await
    }

    async fn request_push(
        push_tx: &mpsc::UnboundedSender<PushRequest>,
    ) -> Result<(), SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        push_tx
            .send(PushRequest { done: done_tx })
            .map_err(|_| SyncError::PushAborted)?;
        done_rx.await.map_err(|_| SyncError::PushAborted)?
    }

    /// Pull remote rows matching `query` into the local store.
    ///
    /// Pending operations on the query's table are pushed first so local
    /// edits cannot be shadowed. With a `query_id` the pull is
    /// incremental: only rows modified since the last pull with the same
    /// id are fetched, and progress is checkpointed per page.
    pub async fn pull(&self, query: &Query, query_id: Option<&str>) -> Result<(), SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(query.table_name())?;

        loop {
            let pending = shared.queue.lock().await.count(Some(&table));
            if pending == 0 {
                break;
            }
            tracing::debug!(%table, pending, "pushing before pull");
            // Taking a second session hold here could park behind a
            // queued `initialize`; go through this session's consumer.
            Self::request_push(&session.push_tx).await?;
        }
        execute_pull(shared, query.clone(), query_id).await
    }

    /// Remove local rows matching `query` without queuing deletions,
    /// returning how many were removed. Resets the table's incremental
    /// pull checkpoints.
    ///
    /// Only the query's filter scopes the purge; ordering, paging, and
    /// projection are ignored. Fails if the table has pending operations.
    pub async fn purge(&self, query: &Query) -> Result<u64, SyncError> {
        let session = self.session_guard().await?;
        let shared = &session.shared;
        let table = normalize_table_name(query.table_name())?;

        let _op = shared.op_lock.read().await;
        let _table = shared.table_locks.write(&table).await;

        if shared.queue.lock().await.count(Some(&table)) > 0 {
            return Err(SyncError::PurgePending { table });
        }
        let mut scope = Query::table(&table);
        if let Some(filter) = query.filter() {
            scope = scope.with_filter(filter.clone());
        }
        let removed = shared.store.delete_by_query(&scope).await?;
        shared
            .store
            .delete_by_query(
                &Query::table(CONFIG_TABLE)
                    .with_filter(Filter::Eq("tableName".into(), json!(table))),
            )
            .await?;
        tracing::info!(table = %query.table_name(), removed, "purged");
        Ok(removed)
    }
}

fn with_id(mut item: Value, item_id: &str) -> Result<Value, SyncError> {
    match item.as_object_mut() {
        Some(obj) => {
            obj.insert(sys::ID.to_string(), Value::String(item_id.to_string()));
            Ok(item)
        }
        None => Err(SyncError::InvalidItem(item.to_string())),
    }
}

fn system_tables() -> Vec<TableDefinition> {
    vec![
        TableDefinition::new(
            OPERATIONS_TABLE,
            vec![
                ColumnDefinition::new("sequence", ColumnType::Integer),
                ColumnDefinition::new("tableName", ColumnType::String),
                ColumnDefinition::new("itemId", ColumnType::String),
                ColumnDefinition::new("kind", ColumnType::String),
                ColumnDefinition::new("state", ColumnType::String),
                ColumnDefinition::new("item", ColumnType::Other),
            ],
        ),
        TableDefinition::new(
            ITEM_BACKUPS_TABLE,
            vec![
                ColumnDefinition::new("tableName", ColumnType::String),
                ColumnDefinition::new("itemId", ColumnType::String),
                ColumnDefinition::new("item", ColumnType::Other),
            ],
        ),
        TableDefinition::new(
            SYNC_ERRORS_TABLE,
            vec![
                ColumnDefinition::new("operationKind", ColumnType::String),
                ColumnDefinition::new("tableName", ColumnType::String),
                ColumnDefinition::new("itemId", ColumnType::String),
                ColumnDefinition::new("clientItem", ColumnType::Other),
                ColumnDefinition::new("status", ColumnType::Integer),
                ColumnDefinition::new("rawResponse", ColumnType::String),
                ColumnDefinition::new("serverItem", ColumnType::Other),
            ],
        ),
        TableDefinition::new(
            CONFIG_TABLE,
            vec![
                ColumnDefinition::new("tableName", ColumnType::String),
                ColumnDefinition::new("value", ColumnType::Other),
            ],
        ),
    ]
}
