//! Provider token refresh.

use super::session::SocialIdentity;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, Method, Transport};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::debug;

/// Fresh provider tokens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Exchanges a provider refresh token for new tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        transport: &dyn Transport,
        config: &ClientConfig,
        identity: &SocialIdentity,
    ) -> Result<TokenSet>;
}

/// OAuth2 `refresh_token` grant against `{auth_host}/oauth/token`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OAuthRefresher;

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(
        &self,
        transport: &dyn Transport,
        config: &ClientConfig,
        identity: &SocialIdentity,
    ) -> Result<TokenSet> {
        let refresh_token = identity
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::InvalidCredentials("no refresh token".into()))?;
        let client_id = identity.client_id.as_deref().unwrap_or(&config.app_key);

        // The serializer is not `Send`; it must not live across the await.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "refresh_token");
            form.append_pair("client_id", client_id);
            form.append_pair("refresh_token", refresh_token);
            if let Some(redirect_uri) = &identity.redirect_uri {
                form.append_pair("redirect_uri", redirect_uri);
            }
            form.finish()
        };

        let credentials = STANDARD.encode(format!("{client_id}:{}", config.app_secret));
        let request = HttpRequest {
            method: Method::Post,
            url: format!("{}/oauth/token", config.auth_host.trim_end_matches('/')),
            headers: vec![
                ("Authorization".into(), format!("Basic {credentials}")),
                (
                    "Content-Type".into(),
                    "application/x-www-form-urlencoded".into(),
                ),
            ],
            body: Some(body),
            timeout: config.timeout,
        };

        debug!(provider = %identity.provider, "refreshing provider tokens");
        let response = transport.send(request).await?;
        if !response.is_success() {
            return Err(Error::from_response(response.status, &response.body));
        }
        Ok(response.json()?)
    }
}
