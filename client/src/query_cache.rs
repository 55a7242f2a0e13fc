//! Last-sync timestamps per query.
//!
//! A pull records the server time at which it ran, keyed by the query
//! fingerprint. The next pull of the same query can ask the server for the
//! changes since then instead of the whole collection.

use crate::error::Result;
use crate::storage::StorageAdapter;
use crate::store::{Entity, LocalStore};
use chrono::{DateTime, Utc};
use docsync_engine::Query;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Partition holding the cache records of every collection.
pub const QUERY_CACHE_COLLECTION: &str = "_query_cache";

/// When a query was last pulled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCacheRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub collection: String,
    pub query_fingerprint: String,
    pub last_sync_timestamp: DateTime<Utc>,
}

impl Entity for QueryCacheRecord {
    fn entity_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_local_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

/// Fingerprint of an optional query; no query means the whole collection.
fn fingerprint(query: Option<&Query>) -> Option<String> {
    match query {
        Some(query) => query.fingerprint(),
        None => Query::new().fingerprint(),
    }
}

/// Query cache shared by every collection of a client.
#[derive(Clone)]
pub struct QueryCacheLedger {
    store: LocalStore<QueryCacheRecord>,
}

impl QueryCacheLedger {
    pub fn new(adapter: Arc<dyn StorageAdapter>, namespace: impl Into<String>) -> Self {
        Self {
            store: LocalStore::new(adapter, namespace, QUERY_CACHE_COLLECTION),
        }
    }

    fn key(collection: &str, fingerprint: &str) -> Query {
        Query::new()
            .equal_to("collection", collection)
            .equal_to("queryFingerprint", fingerprint)
    }

    /// The cache record for `query`, or `None` when there is none or the
    /// query is paged.
    pub async fn get(
        &self,
        collection: &str,
        query: Option<&Query>,
    ) -> Result<Option<QueryCacheRecord>> {
        let Some(fingerprint) = fingerprint(query) else {
            return Ok(None);
        };
        let mut found = self
            .store
            .find(Some(&Self::key(collection, &fingerprint)))
            .await?;
        Ok(found.pop())
    }

    /// Insert or update the record for its `(collection, fingerprint)` key.
    pub async fn put(&self, mut record: QueryCacheRecord) -> Result<QueryCacheRecord> {
        let partition = self.store.lock().await;
        let key = Self::key(&record.collection, &record.query_fingerprint);
        if let Some(existing) = partition.find(Some(&key)).await?.pop() {
            record.id = existing.id;
        }
        partition.save(record).await
    }

    /// Record a successful pull of `query` at `timestamp`. Paged queries
    /// are skipped.
    pub async fn record_sync(
        &self,
        collection: &str,
        query: Option<&Query>,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<QueryCacheRecord>> {
        let Some(query_fingerprint) = fingerprint(query) else {
            debug!(collection, "paged query, not caching sync time");
            return Ok(None);
        };
        let record = self
            .put(QueryCacheRecord {
                id: None,
                collection: collection.to_string(),
                query_fingerprint,
                last_sync_timestamp: timestamp,
            })
            .await?;
        Ok(Some(record))
    }

    /// Forget every cached query of `collection`.
    pub async fn clear(&self, collection: &str) -> Result<usize> {
        let query = Query::new().equal_to("collection", collection);
        self.store.remove(Some(&query)).await
    }
}
