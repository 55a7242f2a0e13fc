//! Session refresh behaviour of the gateway.

use async_trait::async_trait;
use docsync::auth::OAuthRefresher;
use docsync::{
    AuthStrategy, ClientConfig, Error, GatewayState, HttpRequest, HttpResponse,
    MemoryCredentialStore, Request, Session, SessionGateway, SocialIdentity, Transport,
    TransportError,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

const BOOKS: &str = "/appdata/kid_test/books";

/// Identity provider, login endpoint and one data endpoint.
struct AuthServer {
    accepted: Mutex<HashSet<String>>,
    refresh_status: u16,
    login_status: u16,
    reject_all: bool,
    time_out_data: bool,
    gate_refresh: AtomicBool,
    gate: Semaphore,
    refresh_started: Notify,
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    /// `Authorization` header of every data request, in order
    data_auth: Mutex<Vec<String>>,
    refresh_bodies: Mutex<Vec<String>>,
    login_bodies: Mutex<Vec<Value>>,
}

impl AuthServer {
    fn new() -> Self {
        Self {
            accepted: Mutex::new(HashSet::new()),
            refresh_status: 200,
            login_status: 200,
            reject_all: false,
            time_out_data: false,
            gate_refresh: AtomicBool::new(false),
            gate: Semaphore::new(0),
            refresh_started: Notify::new(),
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            data_auth: Mutex::new(Vec::new()),
            refresh_bodies: Mutex::new(Vec::new()),
            login_bodies: Mutex::new(Vec::new()),
        }
    }

    fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn logins(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    fn data_auth(&self) -> Vec<String> {
        self.data_auth.lock().unwrap().clone()
    }
}

fn respond(status: u16, body: Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(
        status,
        Vec::<(String, String)>::new(),
        body.to_string().into_bytes(),
    ))
}

fn failure(status: u16, name: &str) -> Result<HttpResponse, TransportError> {
    respond(status, json!({"error": name, "description": name}))
}

#[async_trait]
impl Transport for AuthServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.url.ends_with("/oauth/token") {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_bodies
                .lock()
                .unwrap()
                .push(request.body.clone().unwrap_or_default());
            self.refresh_started.notify_one();
            if self.gate_refresh.load(Ordering::SeqCst) {
                self.gate.acquire().await.unwrap().forget();
            }
            return match self.refresh_status {
                200 => respond(
                    200,
                    json!({"access_token": "access-2", "refresh_token": "refresh-2"}),
                ),
                status => failure(status, "invalid_grant"),
            };
        }

        if request.url.ends_with("/login") {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
            self.login_bodies.lock().unwrap().push(body);
            return match self.login_status {
                200 => {
                    self.accepted.lock().unwrap().insert("Bearer token-2".into());
                    respond(
                        200,
                        json!({
                            "_id": "user-1",
                            "_kmd": {"authtoken": "token-2"},
                            "_socialIdentity": {
                                "google": {"access_token": "access-2", "refresh_token": "refresh-2"}
                            }
                        }),
                    )
                }
                401 => failure(401, "InvalidCredentials"),
                status => failure(status, "ServerError"),
            };
        }

        let auth = request
            .header("Authorization")
            .unwrap_or_default()
            .to_string();
        self.data_auth.lock().unwrap().push(auth.clone());
        // Keep the request in flight so concurrent callers overlap.
        tokio::task::yield_now().await;

        if self.time_out_data {
            return Err(TransportError::Timeout);
        }
        if self.reject_all || !self.accepted.lock().unwrap().contains(&auth) {
            return failure(401, "InvalidCredentials");
        }
        respond(200, json!([]))
    }
}

fn refreshable_session() -> Session {
    Session {
        user_id: "user-1".into(),
        auth_token: "token-1".into(),
        username: Some("ada".into()),
        social_identity: Some(SocialIdentity {
            provider: "google".into(),
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            client_id: None,
            redirect_uri: None,
        }),
    }
}

fn gateway(server: Arc<AuthServer>) -> Arc<SessionGateway> {
    let config = ClientConfig::new("kid_test", "secret")
        .with_api_host("https://api.test")
        .with_auth_host("https://auth.test");
    Arc::new(SessionGateway::new(
        Arc::new(config),
        server,
        Arc::new(MemoryCredentialStore::with_session(refreshable_session())),
        Arc::new(OAuthRefresher),
    ))
}

async fn token(gateway: &SessionGateway) -> String {
    gateway.active_session().await.unwrap().unwrap().auth_token
}

#[tokio::test]
async fn rejected_token_is_refreshed_and_request_replayed_once() {
    let server = Arc::new(AuthServer::new());
    let gateway = gateway(server.clone());

    let response = gateway.execute(Request::get(BOOKS)).await.unwrap();
    assert_eq!(response.status, 200);

    assert_eq!(server.refreshes(), 1);
    assert_eq!(server.logins(), 1);
    assert_eq!(server.data_auth(), vec!["Bearer token-1", "Bearer token-2"]);
    assert_eq!(token(&gateway).await, "token-2");
    assert_eq!(gateway.state().await, GatewayState::Active);

    let form = server.refresh_bodies.lock().unwrap()[0].clone();
    assert!(form.contains("grant_type=refresh_token"));
    assert!(form.contains("refresh_token=refresh-1"));

    let login = server.login_bodies.lock().unwrap()[0].clone();
    assert_eq!(
        login.pointer("/_socialIdentity/google/access_token"),
        Some(&json!("access-2"))
    );
}

#[tokio::test]
async fn overlapping_failures_share_one_refresh() {
    let server = Arc::new(AuthServer::new());
    let gateway = gateway(server.clone());

    let (a, b) = tokio::join!(
        gateway.execute(Request::get(BOOKS)),
        gateway.execute(Request::get(BOOKS)),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    assert_eq!(server.refreshes(), 1);
    assert_eq!(server.logins(), 1);
    let auth = server.data_auth();
    assert_eq!(auth.len(), 4);
    assert_eq!(auth.iter().filter(|a| *a == "Bearer token-2").count(), 2);
}

#[tokio::test]
async fn requests_issued_during_refresh_wait_for_it() {
    let server = Arc::new(AuthServer::new());
    server.gate_refresh.store(true, Ordering::SeqCst);
    let gateway = gateway(server.clone());

    let first = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.execute(Request::get(BOOKS)).await }
    });
    server.refresh_started.notified().await;
    assert_eq!(gateway.state().await, GatewayState::RefreshInFlight);

    let queued = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.execute(Request::get(BOOKS)).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // Held back until the refresh settles.
    assert_eq!(server.data_auth(), vec!["Bearer token-1"]);

    server.gate.add_permits(1);
    assert!(first.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());

    assert_eq!(server.refreshes(), 1);
    assert_eq!(
        server.data_auth(),
        vec!["Bearer token-1", "Bearer token-2", "Bearer token-2"]
    );
    assert_eq!(gateway.state().await, GatewayState::Active);
}

#[tokio::test]
async fn transient_refresh_failure_keeps_the_session() {
    let server = Arc::new(AuthServer {
        refresh_status: 503,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    let err = gateway.execute(Request::get(BOOKS)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));

    assert_eq!(server.logins(), 0);
    assert_eq!(gateway.state().await, GatewayState::Active);
    assert_eq!(token(&gateway).await, "token-1");
}

#[tokio::test]
async fn rejected_refresh_logs_out() {
    let server = Arc::new(AuthServer {
        refresh_status: 400,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    let err = gateway.execute(Request::get(BOOKS)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));

    assert_eq!(server.logins(), 0);
    assert_eq!(gateway.state().await, GatewayState::LoggedOut);
    assert!(gateway.active_session().await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_relogin_logs_out() {
    let server = Arc::new(AuthServer {
        login_status: 401,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    assert!(gateway.execute(Request::get(BOOKS)).await.is_err());

    assert_eq!(server.refreshes(), 1);
    assert_eq!(server.logins(), 1);
    assert_eq!(gateway.state().await, GatewayState::LoggedOut);
    assert!(gateway.active_session().await.unwrap().is_none());
}

#[tokio::test]
async fn transient_relogin_failure_keeps_refreshed_tokens() {
    let server = Arc::new(AuthServer {
        login_status: 500,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    let err = gateway.execute(Request::get(BOOKS)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));

    assert_eq!(gateway.state().await, GatewayState::Active);
    let session = gateway.active_session().await.unwrap().unwrap();
    assert_eq!(session.auth_token, "token-1");
    let identity = session.social_identity.unwrap();
    assert_eq!(identity.access_token, "access-2");
    assert_eq!(identity.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn replayed_request_is_not_refreshed_again() {
    let server = Arc::new(AuthServer {
        reject_all: true,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    let err = gateway.execute(Request::get(BOOKS)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));

    assert_eq!(server.refreshes(), 1);
    assert_eq!(server.data_auth().len(), 2);
}

#[tokio::test]
async fn timeouts_are_network_errors_without_refresh() {
    let server = Arc::new(AuthServer {
        time_out_data: true,
        ..AuthServer::new()
    });
    let gateway = gateway(server.clone());

    let err = gateway.execute(Request::get(BOOKS)).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
    assert_eq!(server.refreshes(), 0);
    assert_eq!(gateway.state().await, GatewayState::Active);
}

#[tokio::test]
async fn app_credential_failures_are_not_refreshed() {
    let server = Arc::new(AuthServer::new());
    let gateway = gateway(server.clone());

    let err = gateway
        .execute(Request::get(BOOKS).with_auth(AuthStrategy::App))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));
    assert_eq!(server.refreshes(), 0);
}
