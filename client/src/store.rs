//! Local document store.
//!
//! A [`LocalStore`] is a typed view over one storage partition. Every call
//! goes through a single async mutex, so adapter calls for one partition
//! never interleave: two concurrent `save`s are applied one after the other.

use crate::error::{Error, Result};
use crate::storage::StorageAdapter;
use docsync_engine::{evaluate, Document, Query, SyncRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A record shape that can live in a [`LocalStore`].
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn entity_id(&self) -> Option<&str>;

    /// Give an entity without an id a locally generated one.
    fn assign_local_id(&mut self, id: String);
}

impl Entity for Document {
    fn entity_id(&self) -> Option<&str> {
        self.id()
    }

    fn assign_local_id(&mut self, id: String) {
        self.mark_local(id);
    }
}

impl Entity for SyncRecord {
    fn entity_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn assign_local_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Generate a fresh local identifier.
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Store operations without the queue. Only reachable through
/// [`LocalStore::lock`], which holds the queue for the guard's lifetime.
pub struct Partition<T> {
    adapter: Arc<dyn StorageAdapter>,
    namespace: String,
    collection: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Partition<T> {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn matching(&self, query: Option<&Query>) -> Result<Vec<Value>> {
        let records = self.adapter.find(&self.namespace, &self.collection).await?;
        match query {
            Some(query) => Ok(evaluate(records, query)?),
            None => Ok(records),
        }
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        match query {
            Some(_) => Ok(self.matching(query).await?.len()),
            None => self.adapter.count(&self.namespace, &self.collection).await,
        }
    }

    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<T>> {
        self.matching(query).await?.into_iter().map(decode).collect()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        self.adapter
            .find_by_id(&self.namespace, &self.collection, id)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn save(&self, entity: T) -> Result<T> {
        let mut saved = self.save_many(vec![entity]).await?;
        saved.pop().ok_or_else(|| {
            Error::Storage(format!("adapter returned nothing for {}", self.collection))
        })
    }

    pub async fn save_many(&self, entities: Vec<T>) -> Result<Vec<T>> {
        if entities.is_empty() {
            return Ok(entities);
        }

        let records = entities
            .into_iter()
            .map(|mut entity| {
                if entity.entity_id().is_none() {
                    entity.assign_local_id(generate_id());
                }
                Ok(serde_json::to_value(entity)?)
            })
            .collect::<Result<Vec<_>>>()?;

        self.adapter
            .save(&self.namespace, &self.collection, records)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        self.adapter
            .remove_by_id(&self.namespace, &self.collection, id)
            .await
    }

    /// Remove every record matching `query` one id at a time.
    pub async fn remove(&self, query: Option<&Query>) -> Result<usize> {
        let mut removed = 0;
        for record in self.matching(query).await? {
            let id = record.get("_id").and_then(Value::as_str).ok_or_else(|| {
                Error::CorruptDocument(format!("record in {} has no _id", self.collection))
            })?;
            removed += self.remove_by_id(id).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize> {
        self.adapter.clear(&self.namespace, &self.collection).await
    }
}

fn decode<T: DeserializeOwned>(record: Value) -> Result<T> {
    serde_json::from_value(record).map_err(|e| Error::CorruptDocument(e.to_string()))
}

/// Serialized, typed access to one storage partition.
pub struct LocalStore<T> {
    inner: Arc<Mutex<Partition<T>>>,
}

impl<T> Clone for LocalStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> LocalStore<T> {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        namespace: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Partition {
                adapter,
                namespace: namespace.into(),
                collection: collection.into(),
                _marker: PhantomData,
            })),
        }
    }

    /// Hold the queue across several operations.
    pub async fn lock(&self) -> MutexGuard<'_, Partition<T>> {
        self.inner.lock().await
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.lock().await.count(query).await
    }

    pub async fn find(&self, query: Option<&Query>) -> Result<Vec<T>> {
        self.lock().await.find(query).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        self.lock().await.find_by_id(id).await
    }

    /// Save one entity. An entity without an id gets a local one.
    pub async fn save(&self, entity: T) -> Result<T> {
        self.lock().await.save(entity).await
    }

    pub async fn save_many(&self, entities: Vec<T>) -> Result<Vec<T>> {
        self.lock().await.save_many(entities).await
    }

    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        self.lock().await.remove_by_id(id).await
    }

    pub async fn remove(&self, query: Option<&Query>) -> Result<usize> {
        self.lock().await.remove(query).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.lock().await.clear().await
    }
}
