//! Storage adapters.
//!
//! An adapter persists raw JSON records, one partition per
//! `(namespace, collection)` pair. It knows nothing about queries or
//! document metadata; [`LocalStore`](crate::store::LocalStore) layers those
//! on top.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Persistence backend for local partitions.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Number of records in the partition.
    async fn count(&self, namespace: &str, collection: &str) -> Result<usize>;

    /// Every record in the partition, in insertion order.
    async fn find(&self, namespace: &str, collection: &str) -> Result<Vec<Value>>;

    async fn find_by_id(&self, namespace: &str, collection: &str, id: &str)
        -> Result<Option<Value>>;

    /// Insert or replace records by `_id`. Every record must carry an `_id`.
    async fn save(&self, namespace: &str, collection: &str, records: Vec<Value>)
        -> Result<Vec<Value>>;

    /// Remove one record, returning how many were removed.
    async fn remove_by_id(&self, namespace: &str, collection: &str, id: &str) -> Result<usize>;

    /// Remove every record, returning how many were removed.
    async fn clear(&self, namespace: &str, collection: &str) -> Result<usize>;
}

/// In-memory adapter.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    partitions: DashMap<(String, String), Vec<Value>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(namespace: &str, collection: &str) -> (String, String) {
    (namespace.to_string(), collection.to_string())
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("_id").and_then(Value::as_str)
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn count(&self, namespace: &str, collection: &str) -> Result<usize> {
        Ok(self
            .partitions
            .get(&key(namespace, collection))
            .map_or(0, |records| records.len()))
    }

    async fn find(&self, namespace: &str, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .partitions
            .get(&key(namespace, collection))
            .map(|records| records.clone())
            .unwrap_or_default())
    }

    async fn find_by_id(
        &self,
        namespace: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .partitions
            .get(&key(namespace, collection))
            .and_then(|records| records.iter().find(|r| record_id(r) == Some(id)).cloned()))
    }

    async fn save(
        &self,
        namespace: &str,
        collection: &str,
        records: Vec<Value>,
    ) -> Result<Vec<Value>> {
        if records.iter().any(|r| record_id(r).is_none()) {
            return Err(Error::MissingIdentifier);
        }

        let mut partition = self.partitions.entry(key(namespace, collection)).or_default();
        for record in &records {
            let id = record_id(record);
            match partition.iter_mut().find(|existing| record_id(existing) == id) {
                Some(existing) => *existing = record.clone(),
                None => partition.push(record.clone()),
            }
        }
        Ok(records)
    }

    async fn remove_by_id(&self, namespace: &str, collection: &str, id: &str) -> Result<usize> {
        let Some(mut partition) = self.partitions.get_mut(&key(namespace, collection)) else {
            return Ok(0);
        };
        let before = partition.len();
        partition.retain(|r| record_id(r) != Some(id));
        Ok(before - partition.len())
    }

    async fn clear(&self, namespace: &str, collection: &str) -> Result<usize> {
        Ok(self
            .partitions
            .remove(&key(namespace, collection))
            .map_or(0, |(_, records)| records.len()))
    }
}
