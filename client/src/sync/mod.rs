//! Per-collection sync coordination.
//!
//! A [`SyncCoordinator`] owns the local store, the pending ledger and the
//! remote client of one collection. Local writes go to the store and leave
//! a ledger record; [`push`](SyncCoordinator::push) replays those records
//! remotely and [`pull`](SyncCoordinator::pull) refreshes the store from
//! the server.

mod pull;
mod push;

pub use push::PUSH_BATCH_SIZE;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::ledger::SyncLedger;
use crate::query_cache::QueryCacheLedger;
use crate::remote::RemoteCollection;
use crate::storage::StorageAdapter;
use crate::store::LocalStore;
use docsync_engine::{Document, EntityId, Query, SyncOperation, SyncRecord};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of pushing one pending record.
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    /// Id of the document the record was about
    pub id: EntityId,
    pub operation: SyncOperation,
    /// The synchronized document; `None` for deletes and failures
    pub entity: Option<Document>,
    pub error: Option<Error>,
}

impl PushResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a push followed by a pull.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub push: Vec<PushResult>,
    pub pull: usize,
}

/// How a coordinator talks to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub use_delta_set: bool,
    pub auto_pagination: bool,
    pub page_size: usize,
    pub batch_insert: bool,
}

impl From<&ClientConfig> for SyncOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            use_delta_set: config.use_delta_set,
            auto_pagination: config.auto_pagination,
            page_size: config.page_size,
            batch_insert: config.batch_insert,
        }
    }
}

/// Keeps one collection's local cache and the remote in step.
pub struct SyncCoordinator {
    collection: String,
    store: LocalStore<Document>,
    ledger: SyncLedger,
    query_cache: QueryCacheLedger,
    remote: RemoteCollection,
    options: SyncOptions,
    push_in_progress: AtomicBool,
    /// Held by local writes and by push settlement, which both touch the
    /// store and the ledger of a document.
    local_writes: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        namespace: &str,
        ledger: LocalStore<SyncRecord>,
        query_cache: QueryCacheLedger,
        remote: RemoteCollection,
        options: SyncOptions,
    ) -> Self {
        let collection = remote.collection().to_string();
        Self {
            store: LocalStore::new(adapter, namespace, collection.as_str()),
            ledger: SyncLedger::new(ledger, collection.as_str()),
            collection,
            query_cache,
            remote,
            options,
            push_in_progress: AtomicBool::new(false),
            local_writes: Mutex::new(()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Local reads
    // ------------------------------------------------------------------

    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<Document>> {
        self.store.find(query).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        self.store.find_by_id(id).await
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.store.count(query).await
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Save a document locally and queue it for push.
    ///
    /// A document without an id becomes a local document and is queued as
    /// a create; anything else is queued as an update.
    pub async fn save(&self, document: Document) -> Result<Document> {
        let _writes = self.local_writes.lock().await;
        let saved = self.store.save(document).await?;
        let operation = if saved.is_local() {
            SyncOperation::Create
        } else {
            SyncOperation::Update
        };
        self.ledger
            .add_operation(operation, std::slice::from_ref(&saved))
            .await?;
        Ok(saved)
    }

    /// Delete a document locally and queue the delete.
    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        let _writes = self.local_writes.lock().await;
        let Some(document) = self.store.find_by_id(id).await? else {
            return Ok(0);
        };
        let removed = self.store.remove_by_id(id).await?;
        self.ledger
            .add_operation(SyncOperation::Delete, &[document])
            .await?;
        Ok(removed)
    }

    /// Delete every local document matching `query` and queue the deletes.
    pub async fn remove(&self, query: Option<&Query>) -> Result<usize> {
        let _writes = self.local_writes.lock().await;
        let documents = self.store.find(query).await?;
        let mut removed = 0;
        for document in &documents {
            let id = document.id().ok_or_else(|| {
                Error::CorruptDocument(format!("document in {} has no _id", self.collection))
            })?;
            removed += self.store.remove_by_id(id).await?;
        }
        self.ledger
            .add_operation(SyncOperation::Delete, &documents)
            .await?;
        Ok(removed)
    }

    /// Drop local documents matching `query` together with their pending
    /// records, without touching the remote. Cached sync times for the
    /// collection are forgotten as well.
    pub async fn clear(&self, query: Option<&Query>) -> Result<usize> {
        let _writes = self.local_writes.lock().await;
        let removed = match query {
            None => {
                let removed = self.store.clear().await?;
                self.ledger.remove_pending(None).await?;
                removed
            }
            Some(query) => {
                let documents = self.store.find(Some(query)).await?;
                let ids: Vec<&str> = documents.iter().filter_map(Document::id).collect();
                let mut removed = 0;
                for id in &ids {
                    removed += self.store.remove_by_id(id).await?;
                }
                self.ledger.remove_for_entities(ids).await?;
                removed
            }
        };
        self.query_cache.clear(&self.collection).await?;
        debug!(collection = %self.collection, removed, "cleared local cache");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Pending changes
    // ------------------------------------------------------------------

    pub async fn pending_count(&self, query: Option<&Query>) -> Result<usize> {
        self.ledger.count_pending(query).await
    }

    pub async fn pending_entities(&self, query: Option<&Query>) -> Result<Vec<SyncRecord>> {
        self.ledger.find_pending(query).await
    }

    /// Forget pending changes without pushing them.
    pub async fn clear_pending(&self, query: Option<&Query>) -> Result<usize> {
        let _writes = self.local_writes.lock().await;
        self.ledger.remove_pending(query).await
    }

    /// Push pending changes, then pull.
    pub async fn sync(&self, query: Option<&Query>) -> Result<SyncResult> {
        let push = self.push(query).await?;
        let pull = self.pull(query).await?;
        Ok(SyncResult { push, pull })
    }
}
