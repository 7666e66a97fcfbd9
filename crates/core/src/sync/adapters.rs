//! Collaborator contracts consumed by the orchestration engine.
//!
//! The engine never talks to a tracker, a vault, or a database directly;
//! everything external comes in through these traits so hosts can wire their
//! own implementations.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::sync::{BulkImportProgress, SyncErrorCode};

/// One external record as seen by the orchestrator: a stable key plus the
/// opaque field payload the materializer understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRecord {
    pub key: String,
    #[serde(default)]
    pub fields: Value,
}

impl TicketRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Value::Null,
        }
    }
}

/// Page request handed to the ticket source. Pagination is token-driven;
/// there is deliberately no offset field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub max_results: usize,
    pub page_size: usize,
    pub page_token: Option<String>,
}

/// One page of query results. An absent `next_page_token` signals the last
/// page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub records: Vec<TicketRecord>,
    pub total: usize,
    pub next_page_token: Option<String>,
}

/// Query/pagination collaborator fetching external records.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn execute_query(&self, query: &str, page: &PageRequest) -> Result<QueryPage>;
}

/// Result of materializing one record into a local note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeOutcome {
    Created,
    Updated,
    Skipped,
}

/// Per-item materializer options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterializeOptions {
    pub skip_existing: bool,
    pub organize_by_group: bool,
}

/// Per-item materializer collaborator: writes one local note per record.
#[async_trait]
pub trait NoteMaterializer: Send + Sync {
    /// Make sure the destination container (folder, vault section) exists.
    async fn ensure_container(&self, options: &MaterializeOptions) -> Result<()>;

    /// Materialize one record; invoked once per record and awaited before the
    /// next record starts.
    async fn process_ticket(
        &self,
        record: &TicketRecord,
        options: &MaterializeOptions,
    ) -> Result<MaterializeOutcome>;
}

/// Persistence collaborator with merge semantics: saving a partial blob
/// replaces only the top-level keys it carries and leaves unrelated keys
/// untouched. A `null` value removes its key.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self) -> Result<Option<Value>>;
    async fn save_state(&self, patch: Value) -> Result<()>;
}

/// In-memory [`StateStore`] used in tests and by embedders without a real
/// backing store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<serde_json::Map<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_state(&self) -> Result<Option<Value>> {
        let map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Object(map)))
        }
    }

    async fn save_state(&self, patch: Value) -> Result<()> {
        let Value::Object(entries) = patch else {
            return Err(crate::errors::Error::persistence(
                "state patch must be a JSON object",
            ));
        };
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            if value.is_null() {
                map.remove(&key);
            } else {
                map.insert(key, value);
            }
        }
        Ok(())
    }
}

/// Fire-and-forget user-visible notifications. Implementations swallow their
/// own failures; orchestration correctness never depends on delivery.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Notifier that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    fn notify(&self, _message: &str) {}
}

/// Notifier that forwards messages to the log facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        log::info!("[Notify] {}", message);
    }
}

/// Typed listener for import progress and per-item errors.
///
/// Snapshots are deep copies; mutating them never touches engine state. All
/// methods default to no-ops so listeners implement only what they need.
pub trait ImportListener: Send + Sync {
    /// Invoked on every phase transition and at bounded intervals during
    /// batch processing.
    fn on_progress(&self, _snapshot: &BulkImportProgress) {}

    /// Invoked once per failed item.
    fn on_error(&self, _record_id: &str, _message: &str, _code: SyncErrorCode) {}

    /// Invoked after each completed batch.
    fn on_batch_complete(&self, _batch: usize, _total_batches: usize, _processed: usize) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpImportListener;

impl ImportListener for NoOpImportListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_merges_top_level_keys() {
        let store = MemoryStateStore::new();
        store
            .save_state(serde_json::json!({ "a": 1, "b": { "x": true } }))
            .await
            .expect("save");
        store
            .save_state(serde_json::json!({ "b": { "y": false } }))
            .await
            .expect("save");

        let blob = store.load_state().await.expect("load").expect("some");
        assert_eq!(blob.get("a"), Some(&serde_json::json!(1)));
        // Top-level keys replace wholesale; unrelated keys survive.
        assert_eq!(blob.get("b"), Some(&serde_json::json!({ "y": false })));
    }

    #[tokio::test]
    async fn memory_store_null_removes_key() {
        let store = MemoryStateStore::new();
        store
            .save_state(serde_json::json!({ "a": 1, "b": 2 }))
            .await
            .expect("save");
        store
            .save_state(serde_json::json!({ "a": null }))
            .await
            .expect("save");

        let blob = store.load_state().await.expect("load").expect("some");
        assert!(blob.get("a").is_none());
        assert_eq!(blob.get("b"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn memory_store_rejects_non_object_patch() {
        let store = MemoryStateStore::new();
        assert!(store.save_state(serde_json::json!(42)).await.is_err());
    }

    #[tokio::test]
    async fn empty_store_loads_none() {
        let store = MemoryStateStore::new();
        assert!(store.load_state().await.expect("load").is_none());
    }
}
