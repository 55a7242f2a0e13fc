//! Client facade.

use crate::auth::{
    CredentialStore, MemoryCredentialStore, OAuthRefresher, Session, TokenRefresher,
};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::gateway::SessionGateway;
use crate::ledger::SyncLedger;
use crate::query_cache::QueryCacheLedger;
use crate::remote::RemoteCollection;
use crate::storage::{MemoryAdapter, StorageAdapter};
use crate::store::LocalStore;
use crate::sync::{SyncCoordinator, SyncOptions};
use crate::transport::{ReqwestTransport, Transport};
use dashmap::DashMap;
use docsync_engine::SyncRecord;
use std::sync::Arc;

/// Builder for creating a [`Client`] with custom collaborators.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn StorageAdapter>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            storage: None,
            credentials: None,
            refresher: None,
        }
    }

    /// Use a custom transport instead of `reqwest`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom storage adapter instead of keeping data in memory.
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn build(self) -> Client {
        let config = Arc::new(self.config);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryAdapter::new()));
        let gateway = Arc::new(SessionGateway::new(
            config.clone(),
            self.transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
            self.credentials
                .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new())),
            self.refresher.unwrap_or_else(|| Arc::new(OAuthRefresher)),
        ));

        Client {
            ledger: SyncLedger::partition(storage.clone(), config.namespace.as_str()),
            query_cache: QueryCacheLedger::new(storage.clone(), config.namespace.as_str()),
            config,
            gateway,
            storage,
            collections: DashMap::new(),
        }
    }
}

/// Entry point: one per app and user.
pub struct Client {
    config: Arc<ClientConfig>,
    gateway: Arc<SessionGateway>,
    storage: Arc<dyn StorageAdapter>,
    /// Pending records of every collection, behind one queue
    ledger: LocalStore<SyncRecord>,
    query_cache: QueryCacheLedger,
    collections: DashMap<String, Arc<SyncCoordinator>>,
}

impl Client {
    /// A client with the default transport, storage and credential store.
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.gateway
    }

    /// The coordinator for `name`. Every call with the same name returns
    /// the same instance.
    pub fn collection(&self, name: &str) -> Arc<SyncCoordinator> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(SyncCoordinator::new(
                    self.storage.clone(),
                    &self.config.namespace,
                    self.ledger.clone(),
                    self.query_cache.clone(),
                    RemoteCollection::new(self.gateway.clone(), name),
                    SyncOptions::from(self.config.as_ref()),
                ))
            })
            .clone()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        self.gateway.login(username, password).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.gateway.logout().await
    }

    pub async fn active_session(&self) -> Result<Option<Session>> {
        self.gateway.active_session().await
    }
}
