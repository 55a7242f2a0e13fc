//! Push phase - replays pending records against the remote.

use super::{PushResult, SyncCoordinator};
use crate::error::{Error, Result};
use docsync_engine::{Document, Query, SyncOperation, SyncRecord};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Maximum number of records pushed concurrently.
pub const PUSH_BATCH_SIZE: usize = 100;

/// Holds a collection's push flag and resets it on drop.
struct PushGuard<'a>(&'a AtomicBool);

impl<'a> PushGuard<'a> {
    fn acquire(flag: &'a AtomicBool, collection: &str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SyncInProgress {
                collection: collection.to_string(),
            })?;
        Ok(Self(flag))
    }
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    /// Push the pending records matching `query`.
    ///
    /// Returns one result per record, in ledger order. Per-record failures
    /// are reported in the results and never abort the push; only failing
    /// to read the ledger does.
    pub async fn push(&self, query: Option<&Query>) -> Result<Vec<PushResult>> {
        let _guard = PushGuard::acquire(&self.push_in_progress, &self.collection)?;

        let records = self.ledger.find_pending(query).await?;
        if records.is_empty() {
            debug!(collection = %self.collection, "nothing to push");
            return Ok(Vec::new());
        }
        info!(collection = %self.collection, count = records.len(), "pushing pending changes");

        let mut results: Vec<Option<PushResult>> = vec![None; records.len()];
        let (creates, remaining): (Vec<_>, Vec<_>) = records
            .into_iter()
            .enumerate()
            .partition(|(_, record)| {
                self.options.batch_insert && record.operation == SyncOperation::Create
            });

        if !creates.is_empty() {
            for (position, result) in self.push_creates_batched(creates).await {
                results[position] = Some(result);
            }
        }

        for (batch, chunk) in remaining.chunks(PUSH_BATCH_SIZE).enumerate() {
            debug!(collection = %self.collection, batch, size = chunk.len(), "pushing batch");
            let outcomes = join_all(chunk.iter().map(|(position, record)| async move {
                (*position, self.push_record(record).await)
            }))
            .await;
            for (position, result) in outcomes {
                results[position] = Some(result);
            }
        }

        let results: Vec<PushResult> = results.into_iter().flatten().collect();
        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            collection = %self.collection,
            pushed = results.len() - failed,
            failed,
            "push finished"
        );
        Ok(results)
    }

    async fn push_record(&self, record: &SyncRecord) -> PushResult {
        let outcome = match record.operation {
            SyncOperation::Create => self.push_create(record).await,
            SyncOperation::Update => self.push_update(record).await,
            SyncOperation::Delete => self.push_delete(record).await,
        };
        self.settle(record, outcome).await
    }

    async fn push_create(&self, record: &SyncRecord) -> Result<Applied> {
        let entity = snapshot(record)?;
        let created = self.remote.create(&entity.without_local_identity()).await?;
        Ok(Applied::Created(created))
    }

    async fn push_update(&self, record: &SyncRecord) -> Result<Applied> {
        let entity = snapshot(record)?;
        let updated = self.remote.update(entity).await?;
        Ok(Applied::Updated(updated))
    }

    async fn push_delete(&self, record: &SyncRecord) -> Result<Applied> {
        match self.remote.remove_by_id(&record.entity_id).await {
            Ok(_) => Ok(Applied::Deleted),
            Err(Error::NotFound(_)) => {
                debug!(id = %record.entity_id, "already gone remotely");
                Ok(Applied::Deleted)
            }
            Err(err) => Err(err),
        }
    }

    /// Submit every create in one call when the remote accepts arrays.
    async fn push_creates_batched(
        &self,
        creates: Vec<(usize, SyncRecord)>,
    ) -> Vec<(usize, PushResult)> {
        let mut settled = Vec::with_capacity(creates.len());
        let mut submitted = Vec::with_capacity(creates.len());
        let mut documents = Vec::with_capacity(creates.len());

        for (position, record) in creates {
            match snapshot(&record) {
                Ok(entity) => {
                    documents.push(entity.without_local_identity());
                    submitted.push((position, record));
                }
                Err(err) => settled.push((position, self.settle(&record, Err(err)).await)),
            }
        }
        if submitted.is_empty() {
            return settled;
        }

        debug!(collection = %self.collection, count = documents.len(), "batch inserting creates");
        match self.remote.create_many(&documents).await {
            Ok(response) => {
                let mut outcomes = response.into_results().into_iter();
                for (position, record) in submitted {
                    let outcome = match outcomes.next() {
                        Some(created) => created.map(Applied::Created),
                        None => Err(Error::BatchItem {
                            index: position,
                            message: "missing from batch response".into(),
                        }),
                    };
                    settled.push((position, self.settle(&record, outcome).await));
                }
            }
            Err(err) => {
                warn!(collection = %self.collection, error = %err, "batch insert failed");
                for (position, record) in submitted {
                    settled.push((position, self.settle(&record, Err(err.clone())).await));
                }
            }
        }
        settled
    }

    /// Apply a push outcome locally and build the result.
    ///
    /// Runs under the coordinator's local write lock. A record that was
    /// replaced by a newer local write while its request was in flight is
    /// superseded: the newer write is kept, never the server copy.
    async fn settle(&self, record: &SyncRecord, outcome: Result<Applied>) -> PushResult {
        let _writes = self.local_writes.lock().await;

        let outcome = match outcome {
            Ok(applied) => self.apply(record, applied).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            warn!(
                collection = %self.collection,
                id = %record.entity_id,
                operation = %record.operation,
                error = %err,
                "push failed"
            );
            if !err.is_retryable() {
                if let Err(cleanup) = self.ledger.remove_by_id(&record.id).await {
                    warn!(error = %cleanup, "could not drop failed record");
                }
            }
        }

        let (entity, error) = match outcome {
            Ok(entity) => (entity, None),
            Err(err) => (None, Some(err)),
        };
        PushResult {
            id: record.entity_id.clone(),
            operation: record.operation,
            entity,
            error,
        }
    }

    async fn apply(&self, record: &SyncRecord, applied: Applied) -> Result<Option<Document>> {
        let current = self.ledger.record(&record.id).await?.is_some();

        match applied {
            Applied::Deleted => {
                if current {
                    self.ledger.remove_by_id(&record.id).await?;
                }
                Ok(None)
            }
            Applied::Updated(updated) => {
                if current {
                    self.store.save(updated.clone()).await?;
                    self.ledger.remove_by_id(&record.id).await?;
                } else {
                    debug!(id = %record.entity_id, "update superseded while in flight");
                }
                Ok(Some(updated))
            }
            Applied::Created(created) => {
                let server_id = created
                    .id()
                    .ok_or_else(|| {
                        Error::CorruptDocument(format!(
                            "created document in {} has no _id",
                            self.collection
                        ))
                    })?
                    .to_string();

                if current {
                    if record.entity_id != server_id {
                        self.store.remove_by_id(&record.entity_id).await?;
                    }
                    self.store.save(created.clone()).await?;
                    self.ledger.remove_by_id(&record.id).await?;
                } else {
                    self.rekey(record, &created, &server_id).await?;
                }
                Ok(Some(created))
            }
        }
    }

    /// Move whatever happened locally to a document while its create was in
    /// flight onto the id the server assigned.
    async fn rekey(&self, record: &SyncRecord, created: &Document, server_id: &str) -> Result<()> {
        let local_id = record.entity_id.as_str();

        match self.ledger.pending_for(local_id).await? {
            Some(newer) => {
                let operation = match newer.operation {
                    SyncOperation::Delete => SyncOperation::Delete,
                    _ => SyncOperation::Update,
                };
                let latest = newer.entity.as_ref().unwrap_or(created);
                let rekeyed = latest.with_server_id(server_id);

                self.store.remove_by_id(local_id).await?;
                if operation != SyncOperation::Delete {
                    self.store.save(rekeyed.clone()).await?;
                }
                self.ledger.remove_by_id(&newer.id).await?;
                self.ledger.add_operation(operation, &[rekeyed]).await?;
                debug!(
                    collection = %self.collection,
                    local_id,
                    server_id,
                    "carried newer local change onto created document"
                );
            }
            // Pending changes were dropped while the create was in flight.
            // A document still cached locally is adopted; a removed one is
            // left to the next pull.
            None => {
                if self.store.find_by_id(local_id).await?.is_some() {
                    self.store.remove_by_id(local_id).await?;
                    self.store.save(created.clone()).await?;
                }
            }
        }
        Ok(())
    }
}

/// What the remote did with a pushed record.
enum Applied {
    Created(Document),
    Updated(Document),
    Deleted,
}

fn snapshot(record: &SyncRecord) -> Result<&Document> {
    record.entity.as_ref().ok_or_else(|| {
        Error::CorruptDocument(format!("pending record {} has no entity", record.id))
    })
}
