//! Authenticated request execution.
//!
//! Every remote call goes through the [`SessionGateway`]. It attaches
//! credentials, maps error statuses to [`Error`]s and owns the session
//! refresh protocol:
//!
//! ```text
//! Active ──401 on a session request──▶ RefreshInFlight ──▶ Active
//!                                                      └─▶ LoggedOut
//! ```
//!
//! While a refresh runs the request queue is paused: requests that have
//! not been sent yet wait for it, and requests that already failed with the
//! stale token wait for it to settle before their single replay.

use crate::auth::{CredentialStore, Session, SocialIdentity, TokenRefresher};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Which credentials a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// No `Authorization` header
    None,
    /// App key and secret
    App,
    /// The active session's token; fails without a session
    Session,
    /// App key and master secret
    Master,
    /// Session token when logged in, app credentials otherwise
    Default,
}

/// Refresh state of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Active,
    RefreshInFlight,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Transient,
    Unrecoverable,
}

/// A request relative to the API host.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: AuthStrategy,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            auth: AuthStrategy::Default,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_query<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn basic(user: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{secret}")))
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Failures a later refresh attempt may get past.
fn is_transient(err: &Error) -> bool {
    match err {
        Error::Network(_) | Error::Storage(_) => true,
        Error::Server { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Executes requests against the remote API on behalf of one client.
pub struct SessionGateway {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    /// Requests hold a read permit while in flight; a refresh takes the
    /// write side.
    queue: RwLock<()>,
    state: Mutex<GatewayState>,
    /// Bumped each time a new session is stored.
    generation: AtomicU64,
    /// Bumped each time a refresh settles.
    settled: watch::Sender<u64>,
}

impl SessionGateway {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            config,
            transport,
            credentials,
            refresher,
            queue: RwLock::new(()),
            state: Mutex::new(GatewayState::Active),
            generation: AtomicU64::new(0),
            settled,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn user_path(&self, action: &str) -> String {
        format!("/user/{}/{action}", urlencoding::encode(&self.config.app_key))
    }

    pub async fn state(&self) -> GatewayState {
        *self.state.lock().await
    }

    pub async fn active_session(&self) -> Result<Option<Session>> {
        self.credentials.load().await
    }

    /// Store `session` as the active one.
    pub async fn set_session(&self, session: Session) -> Result<()> {
        self.credentials.store(session).await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.state.lock().await = GatewayState::Active;
        Ok(())
    }

    /// Drop the active session.
    pub async fn clear_session(&self) -> Result<()> {
        self.credentials.clear().await?;
        *self.state.lock().await = GatewayState::LoggedOut;
        Ok(())
    }

    /// Log in with a username and password and make the result the
    /// active session.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let request = Request::post(self.user_path("login"))
            .with_auth(AuthStrategy::App)
            .with_json(json!({"username": username, "password": password}));
        let response = self.execute(request).await?;
        let session = Session::from_user(&response.json::<Value>()?)?;
        self.set_session(session.clone()).await?;
        info!(user_id = %session.user_id, "logged in");
        Ok(session)
    }

    /// End the active session remotely, then forget it locally.
    pub async fn logout(&self) -> Result<()> {
        if self.credentials.load().await?.is_some() {
            let request = Request::post(self.user_path("_logout"))
                .with_auth(AuthStrategy::Session);
            if let Err(err) = self.execute(request).await {
                warn!(error = %err, "remote logout failed");
            }
        }
        self.clear_session().await
    }

    /// Execute a request, refreshing the session once if its token was
    /// rejected.
    pub async fn execute(&self, request: Request) -> Result<HttpResponse> {
        match self.dispatch(&request).await {
            (Err(Error::InvalidCredentials(message)), Some(generation)) => {
                self.recover(&request, generation, Error::InvalidCredentials(message))
                    .await
            }
            (result, _) => result,
        }
    }

    async fn dispatch(&self, request: &Request) -> (Result<HttpResponse>, Option<u64>) {
        let _permit = self.queue.read().await;
        self.send(request).await
    }

    async fn replay(&self, request: &Request) -> Result<HttpResponse> {
        debug!(path = %request.path, "replaying request");
        self.dispatch(request).await.0
    }

    /// Send without waiting on the queue. The second value is the session
    /// generation the request was authenticated with, if any.
    async fn send(&self, request: &Request) -> (Result<HttpResponse>, Option<u64>) {
        let (authorization, generation) = match self.authorization(request.auth).await {
            Ok(resolved) => resolved,
            Err(err) => return (Err(err), None),
        };

        debug!(method = request.method.as_str(), path = %request.path, "sending request");
        let result = match self.transport.send(self.build(request, authorization)).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(Error::from_response(response.status, &response.body)),
            Err(err) => Err(err.into()),
        };
        (result, generation)
    }

    async fn authorization(&self, strategy: AuthStrategy) -> Result<(Option<String>, Option<u64>)> {
        let generation = self.generation.load(Ordering::Acquire);
        let app = || basic(&self.config.app_key, &self.config.app_secret);

        match strategy {
            AuthStrategy::None => Ok((None, None)),
            AuthStrategy::App => Ok((Some(app()), None)),
            AuthStrategy::Master => {
                let secret = self
                    .config
                    .master_secret
                    .as_deref()
                    .ok_or_else(|| Error::Config("master secret is not configured".into()))?;
                Ok((Some(basic(&self.config.app_key, secret)), None))
            }
            AuthStrategy::Session => {
                let session = self.credentials.load().await?.ok_or(Error::NoActiveSession)?;
                Ok((Some(bearer(&session.auth_token)), Some(generation)))
            }
            AuthStrategy::Default => match self.credentials.load().await? {
                Some(session) => Ok((Some(bearer(&session.auth_token)), Some(generation))),
                None => Ok((Some(app()), None)),
            },
        }
    }

    fn build(&self, request: &Request, authorization: Option<String>) -> HttpRequest {
        let mut url = format!(
            "{}{}",
            self.config.api_host.trim_end_matches('/'),
            request.path
        );
        if !request.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&request.query)
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("X-Api-Version".to_string(), self.config.api_version.to_string()),
        ];
        if let Some(authorization) = authorization {
            headers.push(("Authorization".to_string(), authorization));
        }
        let body = request.body.as_ref().map(|body| {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
            body.to_string()
        });

        HttpRequest {
            method: request.method,
            url,
            headers,
            body,
            timeout: request.timeout.unwrap_or(self.config.timeout),
        }
    }

    /// Handle a rejected session token. Returns the replayed response or
    /// the original error.
    async fn recover(
        &self,
        request: &Request,
        generation: u64,
        original: Error,
    ) -> Result<HttpResponse> {
        let mut state = self.state.lock().await;

        if *state == GatewayState::RefreshInFlight {
            let mut settled = self.settled.subscribe();
            drop(state);
            debug!(path = %request.path, "waiting for session refresh");
            settled.changed().await.ok();
            return self.replay(request).await;
        }

        // The token was replaced after this request went out.
        if self.generation.load(Ordering::Acquire) != generation {
            drop(state);
            return self.replay(request).await;
        }

        let session = match self.credentials.load().await {
            Ok(Some(session)) if session.is_refreshable() => session,
            _ => return Err(original),
        };
        let Some(identity) = session.social_identity.clone() else {
            return Err(original);
        };

        *state = GatewayState::RefreshInFlight;
        drop(state);
        info!(user_id = %session.user_id, "session token rejected, refreshing");

        let outcome = {
            let _paused = self.queue.write().await;
            self.refresh(session, identity).await
        };

        *self.state.lock().await = match outcome {
            RefreshOutcome::Unrecoverable => GatewayState::LoggedOut,
            _ => GatewayState::Active,
        };
        self.settled.send_modify(|round| *round += 1);

        match outcome {
            RefreshOutcome::Refreshed => self.replay(request).await,
            _ => Err(original),
        }
    }

    /// Refresh provider tokens, then log in again with them. Runs with the
    /// queue paused, so its own requests bypass it.
    async fn refresh(&self, session: Session, identity: SocialIdentity) -> RefreshOutcome {
        let tokens = match self
            .refresher
            .refresh(self.transport.as_ref(), &self.config, &identity)
            .await
        {
            Ok(tokens) => tokens,
            Err(err) if is_transient(&err) => {
                warn!(error = %err, "token refresh failed, keeping session");
                return RefreshOutcome::Transient;
            }
            Err(err) => {
                warn!(error = %err, "token refresh rejected, logging out");
                self.forget_session().await;
                return RefreshOutcome::Unrecoverable;
            }
        };

        let refreshed = SocialIdentity {
            provider: identity.provider,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(identity.refresh_token),
            client_id: identity.client_id,
            redirect_uri: identity.redirect_uri,
        };

        match self.login_with(&refreshed).await {
            Ok(mut renewed) => {
                if renewed.social_identity.is_none() {
                    renewed.social_identity = Some(refreshed);
                }
                if let Err(err) = self.credentials.store(renewed).await {
                    warn!(error = %err, "could not persist refreshed session");
                    return RefreshOutcome::Transient;
                }
                self.generation.fetch_add(1, Ordering::AcqRel);
                info!("session refreshed");
                RefreshOutcome::Refreshed
            }
            Err(err) if is_transient(&err) => {
                warn!(error = %err, "re-login failed, keeping refreshed tokens");
                let kept = Session {
                    social_identity: Some(refreshed),
                    ..session
                };
                if let Err(err) = self.credentials.store(kept).await {
                    warn!(error = %err, "could not persist refreshed tokens");
                }
                RefreshOutcome::Transient
            }
            Err(err) => {
                warn!(error = %err, "re-login rejected, logging out");
                self.forget_session().await;
                RefreshOutcome::Unrecoverable
            }
        }
    }

    async fn login_with(&self, identity: &SocialIdentity) -> Result<Session> {
        let request = Request::post(self.user_path("login"))
            .with_auth(AuthStrategy::App)
            .with_json(identity.login_body());
        let response = self.send(&request).await.0?;
        Session::from_user(&response.json::<Value>()?)
    }

    async fn forget_session(&self) {
        if let Err(err) = self.credentials.clear().await {
            warn!(error = %err, "could not clear session");
        }
    }
}
