//! In-memory stand-in for the remote collection API.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use docsync::{
    Client, ClientConfig, HttpRequest, HttpResponse, MemoryCredentialStore, Method, Session,
    Transport, TransportError,
};
use docsync_engine::{evaluate, Query};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

pub const APP_KEY: &str = "kid_test";

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub segments: Vec<String>,
    pub params: HashMap<String, String>,
    pub body: Option<Value>,
    pub started: usize,
    pub finished: usize,
}

#[derive(Default)]
pub struct RemoteState {
    pub collections: HashMap<String, Vec<Value>>,
    /// Deleted ids with the clock tick they were deleted at
    pub tombstones: HashMap<String, Vec<(String, i64)>>,
    pub clock: i64,
    pub next_id: u64,
    pub requests: Vec<Recorded>,
    pub delta_unsupported: bool,
    pub omit_server_time: bool,
    /// Writes of documents with these titles fail with the given status
    pub failing_titles: HashMap<String, u16>,
    /// Single creates answer without the assigned `_id`
    pub omit_created_id: bool,
}

pub struct MockRemote {
    pub state: Mutex<RemoteState>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    sequence: AtomicUsize,
    held: AtomicBool,
    gate: Semaphore,
    /// Signalled when a held request reaches the mock
    pub arrived: Notify,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn time_at(tick: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(tick)
}

fn format_time(tick: i64) -> String {
    time_at(tick).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn tick_of(raw: &str) -> i64 {
    let time = DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc);
    (time - base_time()).num_seconds()
}

fn json_response(status: u16, tick: Option<i64>, body: Value) -> HttpResponse {
    let headers: Vec<(String, String)> = tick
        .map(|t| vec![("X-Request-Start".to_string(), format_time(t))])
        .unwrap_or_default();
    HttpResponse::new(status, headers, body.to_string().into_bytes())
}

fn error(status: u16, name: &str) -> HttpResponse {
    json_response(status, None, json!({"error": name, "description": name}))
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState::default()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            sequence: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            arrived: Notify::new(),
        })
    }

    /// Park every following request until [`release`](Self::release).
    pub fn hold_requests(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Requests hitting `collection` with `method`.
    pub fn calls(&self, method: Method, collection: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.segments.get(2).map(String::as_str) == Some(collection))
            .collect()
    }

    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_title(&self, title: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_titles
            .insert(title.to_string(), status);
    }

    /// Insert or replace a document as another client would.
    pub fn put(&self, collection: &str, mut doc: Value) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        stamp(&mut doc, tick);
        upsert(state.collections.entry(collection.to_string()).or_default(), doc);
    }

    /// Delete a document as another client would.
    pub fn delete(&self, collection: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .retain(|d| d["_id"] != id);
        state
            .tombstones
            .entry(collection.to_string())
            .or_default()
            .push((id.to_string(), tick));
    }

    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let parsed = url::Url::parse(&request.url)
            .map_err(|e| TransportError::NoResponse(e.to_string()))?;
        let segments: Vec<String> = parsed
            .path_segments()
            .map(|s| s.map(|p| urlencoding::decode(p).unwrap().into_owned()).collect())
            .unwrap_or_default();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let body: Option<Value> = request.body.as_deref().map(|b| serde_json::from_str(b).unwrap());

        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let header_tick = (!state.omit_server_time).then_some(tick);

        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
        let response = match (request.method, parts.as_slice()) {
            (Method::Post, ["user", _, "login"]) => json_response(
                200,
                None,
                json!({"_id": "user-1", "username": "ada", "_kmd": {"authtoken": "token-1"}}),
            ),
            (Method::Post, ["user", _, "_logout"]) => json_response(204, None, json!({})),
            (Method::Get, ["appdata", _, collection]) => {
                let docs = state.collections.get(*collection).cloned().unwrap_or_default();
                json_response(200, header_tick, Value::Array(evaluate(docs, &query_from(&params)).unwrap()))
            }
            (Method::Get, ["appdata", _, collection, "_count"]) => {
                let docs = state.collections.get(*collection).cloned().unwrap_or_default();
                let count = evaluate(docs, &query_from(&params)).unwrap().len();
                json_response(200, header_tick, json!({"count": count}))
            }
            (Method::Get, ["appdata", _, collection, "_deltaset"]) => {
                if state.delta_unsupported {
                    error(400, "FeatureUnavailable")
                } else {
                    let since = tick_of(&params["since"]);
                    let docs = state.collections.get(*collection).cloned().unwrap_or_default();
                    let changed: Vec<Value> = evaluate(docs, &query_from(&params))
                        .unwrap()
                        .into_iter()
                        .filter(|d| tick_of(d["_kmd"]["lmt"].as_str().unwrap()) > since)
                        .collect();
                    let deleted: Vec<Value> = state
                        .tombstones
                        .get(*collection)
                        .map(|t| {
                            t.iter()
                                .filter(|(_, at)| *at > since)
                                .map(|(id, _)| json!({"_id": id}))
                                .collect()
                        })
                        .unwrap_or_default();
                    json_response(200, header_tick, json!({"changed": changed, "deleted": deleted}))
                }
            }
            (Method::Get, ["appdata", _, collection, id]) => {
                match state
                    .collections
                    .get(*collection)
                    .and_then(|docs| docs.iter().find(|d| d["_id"] == *id).cloned())
                {
                    Some(doc) => json_response(200, header_tick, doc),
                    None => error(404, "EntityNotFound"),
                }
            }
            (Method::Post, ["appdata", _, collection]) => match body {
                Some(Value::Array(docs)) => {
                    let mut entities = Vec::new();
                    let mut errors = Vec::new();
                    for (index, doc) in docs.into_iter().enumerate() {
                        if state.failing_titles.contains_key(title(&doc)) {
                            entities.push(Value::Null);
                            errors.push(json!({"index": index, "message": format!("rejected {}", title(&doc))}));
                        } else {
                            entities.push(create(&mut state, collection, doc, tick));
                        }
                    }
                    json_response(201, header_tick, json!({"entities": entities, "errors": errors}))
                }
                Some(doc) => match state.failing_titles.get(title(&doc)).copied() {
                    Some(status) => error(status, "ValidationError"),
                    None => {
                        let mut created = create(&mut state, collection, doc, tick);
                        if state.omit_created_id {
                            if let Some(fields) = created.as_object_mut() {
                                fields.remove("_id");
                            }
                        }
                        json_response(201, header_tick, created)
                    }
                },
                None => error(400, "BadRequest"),
            },
            (Method::Put, ["appdata", _, collection, id]) => {
                let mut doc = body.unwrap_or_else(|| json!({}));
                match state.failing_titles.get(title(&doc)).copied() {
                    Some(status) => error(status, "ValidationError"),
                    None => {
                        doc["_id"] = json!(id);
                        stamp(&mut doc, tick);
                        upsert(state.collections.entry(collection.to_string()).or_default(), doc.clone());
                        json_response(200, header_tick, doc)
                    }
                }
            }
            (Method::Delete, ["appdata", _, collection, id]) => {
                let docs = state.collections.entry(collection.to_string()).or_default();
                let before = docs.len();
                docs.retain(|d| d["_id"] != *id);
                if docs.len() == before {
                    error(404, "EntityNotFound")
                } else {
                    state
                        .tombstones
                        .entry(collection.to_string())
                        .or_default()
                        .push((id.to_string(), tick));
                    json_response(200, header_tick, json!({"count": 1}))
                }
            }
            _ => error(404, "NotFound"),
        };

        state.requests.push(Recorded {
            method: request.method,
            segments,
            params,
            body: request.body.as_deref().map(|b| serde_json::from_str(b).unwrap()),
            started: 0,
            finished: 0,
        });
        Ok(response)
    }
}

fn title(doc: &Value) -> &str {
    doc.get("title").and_then(Value::as_str).unwrap_or_default()
}

fn stamp(doc: &mut Value, tick: i64) {
    let lmt = format_time(tick);
    match doc.get_mut("_kmd").and_then(Value::as_object_mut) {
        Some(kmd) => {
            kmd.insert("lmt".into(), json!(lmt));
            kmd.remove("local");
        }
        None => doc["_kmd"] = json!({"lmt": lmt, "ect": lmt}),
    }
}

fn upsert(docs: &mut Vec<Value>, doc: Value) {
    match docs.iter_mut().find(|d| d["_id"] == doc["_id"]) {
        Some(existing) => *existing = doc,
        None => docs.push(doc),
    }
}

fn create(state: &mut RemoteState, collection: &str, mut doc: Value, tick: i64) -> Value {
    if doc.get("_id").is_none() {
        state.next_id += 1;
        doc["_id"] = json!(format!("srv-{}", state.next_id));
    }
    stamp(&mut doc, tick);
    upsert(state.collections.entry(collection.to_string()).or_default(), doc.clone());
    doc
}

fn query_from(params: &HashMap<String, String>) -> Query {
    let filter: Map<String, Value> = params
        .get("query")
        .map(|q| serde_json::from_str(q).unwrap())
        .unwrap_or_default();
    let mut query = Query::from_filter(filter);
    if let Some(sort) = params.get("sort") {
        let sort: Map<String, Value> = serde_json::from_str(sort).unwrap();
        for (field, direction) in sort {
            query = if direction == json!(-1) {
                query.descending(field)
            } else {
                query.ascending(field)
            };
        }
    }
    if let Some(skip) = params.get("skip") {
        query = query.with_skip(skip.parse().unwrap());
    }
    if let Some(limit) = params.get("limit") {
        query = query.with_limit(limit.parse().unwrap());
    }
    query
}

#[async_trait]
impl Transport for MockRemote {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let started = self.sequence.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        // Let sibling requests start before this one completes.
        tokio::task::yield_now().await;
        if self.held.load(Ordering::SeqCst) {
            self.arrived.notify_one();
            self.gate.acquire().await.unwrap().forget();
        }

        let response = self.handle(&request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.requests.last_mut() {
            last.started = started;
            last.finished = finished;
        }
        response
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new(APP_KEY, "secret").with_api_host("https://mock.test")
}

/// A client logged in as `user-1` and wired to `remote`.
pub fn client(remote: &Arc<MockRemote>, config: ClientConfig) -> Client {
    let session = Session {
        user_id: "user-1".into(),
        auth_token: "token-1".into(),
        username: Some("ada".into()),
        social_identity: None,
    };
    Client::builder(config)
        .transport(remote.clone())
        .credential_store(Arc::new(MemoryCredentialStore::with_session(session)))
        .build()
}
