//! Sessions and where they are kept.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// Tokens issued by an identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialIdentity {
    pub provider: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl SocialIdentity {
    /// Parse one `provider: {access_token, ...}` entry of a user's
    /// `_socialIdentity`.
    pub fn from_tokens(provider: &str, tokens: &Value) -> Option<Self> {
        let text = |key: &str| tokens.get(key).and_then(Value::as_str).map(String::from);
        Some(Self {
            provider: provider.to_string(),
            access_token: text("access_token")?,
            refresh_token: text("refresh_token"),
            client_id: text("client_id"),
            redirect_uri: text("redirect_uri"),
        })
    }

    /// Body of a login request that authenticates with these tokens.
    pub fn login_body(&self) -> Value {
        let mut tokens = Map::new();
        tokens.insert("access_token".into(), self.access_token.clone().into());
        let optional = [
            ("refresh_token", &self.refresh_token),
            ("client_id", &self.client_id),
            ("redirect_uri", &self.redirect_uri),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                tokens.insert(key.into(), value.clone().into());
            }
        }

        let mut identity = Map::new();
        identity.insert(self.provider.clone(), Value::Object(tokens));
        let mut body = Map::new();
        body.insert("_socialIdentity".into(), Value::Object(identity));
        Value::Object(body)
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_identity: Option<SocialIdentity>,
}

impl Session {
    /// Build a session from the user document a login returns.
    pub fn from_user(user: &Value) -> Result<Self> {
        let user_id = user
            .get("_id")
            .and_then(Value::as_str)
            .ok_or(Error::MissingIdentifier)?;
        let auth_token = user
            .pointer("/_kmd/authtoken")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization("login response has no auth token".into()))?;

        let social_identity = user
            .get("_socialIdentity")
            .and_then(Value::as_object)
            .and_then(|providers| providers.iter().next())
            .and_then(|(provider, tokens)| SocialIdentity::from_tokens(provider, tokens));

        Ok(Self {
            user_id: user_id.to_string(),
            auth_token: auth_token.to_string(),
            username: user.get("username").and_then(Value::as_str).map(String::from),
            social_identity,
        })
    }

    /// Whether the session can be renewed without the user's password.
    pub fn is_refreshable(&self) -> bool {
        self.social_identity
            .as_ref()
            .is_some_and(|identity| identity.refresh_token.is_some())
    }
}

/// Persistence for the active session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;

    async fn store(&self, session: Session) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Keeps the session in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: RwLock<Option<Session>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.read().await.clone())
    }

    async fn store(&self, session: Session) -> Result<()> {
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.write().await = None;
        Ok(())
    }
}
