//! # docsync
//!
//! Offline-first client for remote document collections.
//!
//! Documents are read from and written to a local cache. Writes are
//! recorded in a pending ledger and pushed later; pulls refresh the cache
//! from the server, incrementally when the server supports delta sets.
//!
//! ```no_run
//! use docsync::{Client, ClientConfig, Document, Query};
//!
//! # async fn run() -> docsync::Result<()> {
//! let client = Client::new(ClientConfig::from_env()?);
//! client.login("ada", "secret").await?;
//!
//! let books = client.collection("books");
//! books.save(Document::new().set("title", "Dune")).await?;
//! books.push(None).await?;
//!
//! let recent = Query::new().greater_than("year", 1960);
//! books.pull(Some(&recent)).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod query_cache;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;

pub use auth::{CredentialStore, MemoryCredentialStore, Session, SocialIdentity, TokenRefresher};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConfigError};
pub use error::{Error, Result};
pub use gateway::{AuthStrategy, GatewayState, Request, SessionGateway};
pub use ledger::SyncLedger;
pub use query_cache::{QueryCacheLedger, QueryCacheRecord};
pub use remote::RemoteCollection;
pub use storage::{MemoryAdapter, StorageAdapter};
pub use store::{Entity, LocalStore};
pub use sync::{PushResult, SyncCoordinator, SyncOptions, SyncResult, PUSH_BATCH_SIZE};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};

pub use docsync_engine::{Document, Query, SyncOperation, SyncRecord};
