//! Remote collection API.
//!
//! Thin typed wrappers over `{api_host}/appdata/{app_key}/{collection}`.
//! Every read also hands back the server time the request started at, which
//! the pull phase uses as its next delta-set baseline.

use crate::error::{Error, Result};
use crate::gateway::{Request, SessionGateway};
use crate::transport::HttpResponse;
use chrono::{DateTime, SecondsFormat, Utc};
use docsync_engine::{Document, Query};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Response header carrying the server time a request started at.
pub const SERVER_TIME_HEADER: &str = "X-Request-Start";

/// A response body plus the server time it was produced at.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse<T> {
    pub data: T,
    pub server_time: Option<DateTime<Utc>>,
}

/// Reference to a document deleted remotely.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletedRef {
    #[serde(rename = "_id")]
    pub id: String,
}

/// Changes since a point in time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeltaSet {
    #[serde(default)]
    pub changed: Vec<Document>,
    #[serde(default)]
    pub deleted: Vec<DeletedRef>,
}

/// One failed entry of a batch create.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchError {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub message: String,
}

/// Result of a batch create.
///
/// `entities` has one slot per submitted document; a `null` slot failed,
/// and the n-th `null` is described by the n-th entry of `errors`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BatchCreateResponse {
    #[serde(default)]
    pub entities: Vec<Option<Document>>,
    #[serde(default)]
    pub errors: Vec<BatchError>,
}

impl BatchCreateResponse {
    /// Pair every slot with its created document or its error.
    pub fn into_results(self) -> Vec<Result<Document>> {
        let mut errors = self.errors.into_iter();
        self.entities
            .into_iter()
            .enumerate()
            .map(|(position, entity)| match entity {
                Some(document) => Ok(document),
                None => Err(match errors.next() {
                    Some(error) => Error::BatchItem {
                        index: error.index,
                        message: error.message,
                    },
                    None => Error::BatchItem {
                        index: position,
                        message: "entity was not created".into(),
                    },
                }),
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct CountBody {
    count: usize,
}

fn server_time(response: &HttpResponse) -> Option<DateTime<Utc>> {
    let raw = response.header(SERVER_TIME_HEADER)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    Ok(response.json()?)
}

fn filter_params(query: Option<&Query>) -> Vec<(&'static str, String)> {
    query
        .map(Query::to_query_params)
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, _)| *name == "query")
        .collect()
}

/// One remote collection.
#[derive(Clone)]
pub struct RemoteCollection {
    gateway: Arc<SessionGateway>,
    collection: String,
    path: String,
}

impl RemoteCollection {
    pub fn new(gateway: Arc<SessionGateway>, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        let path = format!(
            "/appdata/{}/{}",
            urlencoding::encode(&gateway.config().app_key),
            urlencoding::encode(&collection)
        );
        Self {
            gateway,
            collection,
            path,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn entity_path(&self, id: &str) -> String {
        format!("{}/{}", self.path, urlencoding::encode(id))
    }

    pub async fn find(&self, query: Option<&Query>) -> Result<RemoteResponse<Vec<Document>>> {
        let params = query.map(Query::to_query_params).unwrap_or_default();
        let response = self
            .gateway
            .execute(Request::get(self.path.as_str()).with_query(params))
            .await?;
        Ok(RemoteResponse {
            data: decode(&response)?,
            server_time: server_time(&response),
        })
    }

    pub async fn count(&self, query: Option<&Query>) -> Result<RemoteResponse<usize>> {
        let response = self
            .gateway
            .execute(Request::get(format!("{}/_count", self.path)).with_query(filter_params(query)))
            .await?;
        let body: CountBody = decode(&response)?;
        Ok(RemoteResponse {
            data: body.count,
            server_time: server_time(&response),
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<RemoteResponse<Document>> {
        let response = self.gateway.execute(Request::get(self.entity_path(id))).await?;
        Ok(RemoteResponse {
            data: decode(&response)?,
            server_time: server_time(&response),
        })
    }

    pub async fn create(&self, document: &Document) -> Result<Document> {
        let response = self
            .gateway
            .execute(Request::post(self.path.as_str()).with_json(document.to_value()?))
            .await?;
        decode(&response)
    }

    /// Create several documents in one call.
    pub async fn create_many(&self, documents: &[Document]) -> Result<BatchCreateResponse> {
        let body = documents
            .iter()
            .map(Document::to_value)
            .collect::<docsync_engine::error::Result<Vec<_>>>()?;
        debug!(collection = %self.collection, count = documents.len(), "batch create");
        let response = self
            .gateway
            .execute(Request::post(self.path.as_str()).with_json(Value::Array(body)))
            .await?;
        decode(&response)
    }

    pub async fn update(&self, document: &Document) -> Result<Document> {
        let id = document.id().ok_or(Error::MissingIdentifier)?;
        let response = self
            .gateway
            .execute(Request::put(self.entity_path(id)).with_json(document.to_value()?))
            .await?;
        decode(&response)
    }

    /// Delete every document matching `query`, returning how many went.
    pub async fn remove(&self, query: Option<&Query>) -> Result<usize> {
        let response = self
            .gateway
            .execute(Request::delete(self.path.as_str()).with_query(filter_params(query)))
            .await?;
        Ok(decode::<CountBody>(&response)?.count)
    }

    pub async fn remove_by_id(&self, id: &str) -> Result<usize> {
        let response = self
            .gateway
            .execute(Request::delete(self.entity_path(id)))
            .await?;
        Ok(decode::<CountBody>(&response)?.count)
    }

    /// Changes to the documents matching `query` since `since`.
    pub async fn delta_set(
        &self,
        query: Option<&Query>,
        since: DateTime<Utc>,
    ) -> Result<RemoteResponse<DeltaSet>> {
        let mut params: Vec<(&'static str, String)> = query
            .map(Query::to_query_params)
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| !matches!(*name, "skip" | "limit"))
            .collect();
        params.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));

        let response = self
            .gateway
            .execute(Request::get(format!("{}/_deltaset", self.path)).with_query(params))
            .await?;
        Ok(RemoteResponse {
            data: decode(&response)?,
            server_time: server_time(&response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_errors_pair_by_position() {
        let response: BatchCreateResponse = serde_json::from_value(json!({
            "entities": [{"_id": "a"}, null, {"_id": "c"}, null],
            "errors": [
                {"index": 7, "message": "first failure"},
                {"index": 9, "message": "second failure"}
            ]
        }))
        .unwrap();

        let results = response.into_results();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().id(), Some("a"));
        assert_eq!(
            results[1].as_ref().unwrap_err(),
            &Error::BatchItem {
                index: 7,
                message: "first failure".into()
            }
        );
        assert_eq!(results[2].as_ref().unwrap().id(), Some("c"));
        assert_eq!(
            results[3].as_ref().unwrap_err(),
            &Error::BatchItem {
                index: 9,
                message: "second failure".into()
            }
        );
    }

    #[test]
    fn missing_error_entries_still_fail() {
        let response = BatchCreateResponse {
            entities: vec![None],
            errors: Vec::new(),
        };
        assert!(matches!(
            response.into_results()[0],
            Err(Error::BatchItem { index: 0, .. })
        ));
    }

    #[test]
    fn server_time_parses_rfc3339() {
        let response = HttpResponse::new(
            200,
            [("x-request-start", "2024-03-01T10:00:00.250Z")],
            Vec::new(),
        );
        let time = server_time(&response).unwrap();
        assert_eq!(
            time.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-03-01T10:00:00.250Z"
        );

        let garbled = HttpResponse::new(200, [("x-request-start", "yesterday")], Vec::new());
        assert!(server_time(&garbled).is_none());
    }

    #[test]
    fn count_and_delete_only_send_the_filter() {
        let query = Query::new()
            .equal_to("a", 1)
            .ascending("a")
            .with_limit(5);
        let params = filter_params(Some(&query));
        assert_eq!(params, vec![("query", r#"{"a":1}"#.to_string())]);
        assert!(filter_params(None).is_empty());
    }
}
