//! Pending operation ledger.
//!
//! Every collection records its unsynced mutations in one shared ledger
//! partition. A [`SyncLedger`] is scoped to a single collection: each query
//! it runs is ANDed with `{collection: <name>}`, and caller queries written
//! against document fields are rewritten to target the `entity` snapshot.

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;
use crate::store::{generate_id, LocalStore};
use docsync_engine::{Document, Query, SyncOperation, SyncRecord};
use std::sync::Arc;
use tracing::debug;

/// Partition holding the pending records of every collection.
pub const SYNC_LEDGER_COLLECTION: &str = "_sync_ledger";

/// Pending operations for one collection.
#[derive(Clone)]
pub struct SyncLedger {
    collection: String,
    store: LocalStore<SyncRecord>,
}

impl SyncLedger {
    /// The store over the ledger partition of `namespace`. All ledgers of
    /// one client must be built from clones of a single such store, so
    /// their adapter calls share one queue.
    pub fn partition(
        adapter: Arc<dyn StorageAdapter>,
        namespace: impl Into<String>,
    ) -> LocalStore<SyncRecord> {
        LocalStore::new(adapter, namespace, SYNC_LEDGER_COLLECTION)
    }

    pub fn new(store: LocalStore<SyncRecord>, collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            store,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn scope(&self) -> Query {
        Query::new().equal_to("collection", self.collection.as_str())
    }

    /// Translate a document query into ledger field space and pin it to
    /// this collection. Sort and paging carry over.
    fn scoped(&self, query: Option<&Query>) -> Query {
        match query {
            Some(query) => query.with_field_prefix("entity.").and(self.scope()),
            None => self.scope(),
        }
    }

    /// Record `operation` for each document.
    ///
    /// Any earlier record for the same documents is dropped first, so the
    /// ledger holds at most one record per document. Deletes of documents
    /// that never reached the server only drop what was pending.
    pub async fn add_operation(
        &self,
        operation: SyncOperation,
        documents: &[Document],
    ) -> Result<Vec<SyncRecord>> {
        let ids = documents
            .iter()
            .map(|doc| doc.id().ok_or(Error::MissingIdentifier))
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let partition = self.store.lock().await;

        let superseded = self.scope().contained_in("entityId", ids.iter().copied());
        let replaced = partition.remove(Some(&superseded)).await?;

        let records: Vec<SyncRecord> = documents
            .iter()
            .zip(&ids)
            .filter(|(doc, _)| !(operation == SyncOperation::Delete && doc.is_local()))
            .map(|(doc, id)| {
                SyncRecord::new(
                    generate_id(),
                    operation,
                    self.collection.as_str(),
                    *id,
                    Some(doc.clone()),
                )
            })
            .collect();

        let saved = partition.save_many(records).await?;
        debug!(
            collection = %self.collection,
            operation = %operation,
            recorded = saved.len(),
            replaced,
            "recorded pending operation"
        );
        Ok(saved)
    }

    /// Pending records whose entity snapshot matches `query`.
    pub async fn find_pending(&self, query: Option<&Query>) -> Result<Vec<SyncRecord>> {
        self.store.find(Some(&self.scoped(query))).await
    }

    pub async fn count_pending(&self, query: Option<&Query>) -> Result<usize> {
        self.store.count(Some(&self.scoped(query))).await
    }

    /// Drop pending records whose entity snapshot matches `query`.
    pub async fn remove_pending(&self, query: Option<&Query>) -> Result<usize> {
        self.store.remove(Some(&self.scoped(query))).await
    }

    /// The record with ledger id `record_id`, if it is still pending.
    pub async fn record(&self, record_id: &str) -> Result<Option<SyncRecord>> {
        Ok(self
            .store
            .find_by_id(record_id)
            .await?
            .filter(|record| record.collection == self.collection))
    }

    /// The pending record of one document.
    pub async fn pending_for(&self, entity_id: &str) -> Result<Option<SyncRecord>> {
        let query = self.scope().equal_to("entityId", entity_id);
        Ok(self.store.find(Some(&query)).await?.into_iter().next())
    }

    /// Drop one record by its ledger id.
    pub async fn remove_by_id(&self, record_id: &str) -> Result<usize> {
        self.store.remove_by_id(record_id).await
    }

    /// Drop the records of the given documents.
    pub async fn remove_for_entities<I, S>(&self, entity_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let query = self
            .scope()
            .contained_in("entityId", entity_ids.into_iter().map(Into::into));
        self.store.remove(Some(&query)).await
    }
}
