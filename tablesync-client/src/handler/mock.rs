//! Scriptable in-memory handler for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tablesync_types::{HandlerError, Query, TableOperation};

use super::SyncHandler;

#[derive(Default)]
struct State {
    execute_results: VecDeque<Result<Option<Value>, HandlerError>>,
    read_results: VecDeque<Result<Vec<Value>, HandlerError>>,
    executed: Vec<(TableOperation, Option<Value>)>,
    reads: Vec<Query>,
}

/// A [`SyncHandler`] that replays scripted responses and records every
/// call it receives.
///
/// With nothing scripted it behaves like a permissive server: inserts and
/// updates echo the sent item back, deletes succeed with no body, and
/// pull queries return an empty page.
#[derive(Default)]
pub struct MockSyncHandler {
    state: Mutex<State>,
}

impl MockSyncHandler {
    /// Create a mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `execute` outcome. Queued outcomes are consumed in
    /// order.
    pub fn queue_execute(&self, result: Result<Option<Value>, HandlerError>) {
        self.state.lock().unwrap().execute_results.push_back(result);
    }

    /// Script the next `read` page.
    pub fn queue_read(&self, rows: Vec<Value>) {
        self.state.lock().unwrap().read_results.push_back(Ok(rows));
    }

    /// Script the next `read` failure.
    pub fn queue_read_error(&self, error: HandlerError) {
        self.state.lock().unwrap().read_results.push_back(Err(error));
    }

    /// Every operation executed so far, with the item payload each was
    /// given.
    pub fn executed(&self) -> Vec<(TableOperation, Option<Value>)> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Every pull query read so far.
    pub fn read_queries(&self) -> Vec<Query> {
        self.state.lock().unwrap().reads.clone()
    }
}

#[async_trait]
impl SyncHandler for MockSyncHandler {
    async fn execute(
        &self,
        operation: &TableOperation,
        item: Option<&Value>,
    ) -> Result<Option<Value>, HandlerError> {
        let mut state = self.state.lock().unwrap();
        state
            .executed
            .push((operation.clone(), item.cloned()));
        match state.execute_results.pop_front() {
            Some(result) => result,
            // Echo semantics: the server accepts the payload as-is.
            None => match operation.kind {
                tablesync_types::OperationKind::Delete => Ok(None),
                _ => Ok(item.cloned()),
            },
        }
    }

    async fn read(&self, query: &Query) -> Result<Vec<Value>, HandlerError> {
        let mut state = self.state.lock().unwrap();
        state.reads.push(query.clone());
        state.read_results.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
