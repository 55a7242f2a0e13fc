//! Pull phase - refreshes the local cache from the remote.

use super::SyncCoordinator;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use docsync_engine::Query;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

impl SyncCoordinator {
    /// Pull documents matching `query` into the local cache, returning how
    /// many documents changed.
    ///
    /// Refused with [`Error::PendingChanges`] while the collection has
    /// unpushed records, since replacing the cache would lose them.
    pub async fn pull(&self, query: Option<&Query>) -> Result<usize> {
        let pending = self.ledger.count_pending(None).await?;
        if pending > 0 {
            return Err(Error::PendingChanges { count: pending });
        }

        if self.options.use_delta_set {
            if let Some(cached) = self.query_cache.get(&self.collection, query).await? {
                match self.pull_delta(query, cached.last_sync_timestamp).await {
                    Ok(changed) => return Ok(changed),
                    Err(err) if err.is_delta_set_unsupported() => {
                        warn!(
                            collection = %self.collection,
                            error = %err,
                            "delta set unavailable, falling back to a full pull"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if self.options.auto_pagination {
            self.pull_paginated(query).await
        } else {
            self.pull_full(query).await
        }
    }

    async fn pull_delta(&self, query: Option<&Query>, since: DateTime<Utc>) -> Result<usize> {
        debug!(collection = %self.collection, %since, "delta pull");
        let response = self.remote.delta_set(query, since).await?;
        let delta = response.data;
        let changed = delta.changed.len() + delta.deleted.len();

        for deleted in &delta.deleted {
            self.store.remove_by_id(&deleted.id).await?;
        }
        self.store.save_many(delta.changed).await?;
        self.record_sync(query, response.server_time).await?;

        info!(collection = %self.collection, changed, "delta pull finished");
        Ok(changed)
    }

    async fn pull_full(&self, query: Option<&Query>) -> Result<usize> {
        let response = self.remote.find(query).await?;
        let documents = response.data;
        let count = documents.len();

        match query {
            Some(query) => {
                self.store.remove(Some(query)).await?;
            }
            None => {
                self.store.clear().await?;
                self.query_cache.clear(&self.collection).await?;
            }
        }
        self.store.save_many(documents).await?;
        self.record_sync(query, response.server_time).await?;

        info!(collection = %self.collection, count, "full pull finished");
        Ok(count)
    }

    async fn pull_paginated(&self, query: Option<&Query>) -> Result<usize> {
        self.store.clear().await?;
        self.query_cache.clear(&self.collection).await?;

        let counted = self.remote.count(query).await?;
        let total = counted.data;
        let page_size = self.options.page_size.max(1);
        let pages = total.div_ceil(page_size);
        debug!(collection = %self.collection, total, pages, "paginated pull");

        let base = query.map(|q| q.resolved().into_owned()).unwrap_or_default();
        let responses = try_join_all((0..pages).map(|page| {
            let page_query = base
                .clone()
                .with_skip(page * page_size)
                .with_limit(page_size);
            async move { self.remote.find(Some(&page_query)).await }
        }))
        .await?;

        let mut count = 0;
        for response in responses {
            count += response.data.len();
            self.store.save_many(response.data).await?;
        }
        self.record_sync(query, counted.server_time).await?;

        info!(collection = %self.collection, count, pages, "paginated pull finished");
        Ok(count)
    }

    async fn record_sync(
        &self,
        query: Option<&Query>,
        server_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match server_time {
            Some(timestamp) => {
                self.query_cache
                    .record_sync(&self.collection, query, timestamp)
                    .await?;
            }
            None => warn!(
                collection = %self.collection,
                "response carried no server time, delta baseline not updated"
            ),
        }
        Ok(())
    }
}
