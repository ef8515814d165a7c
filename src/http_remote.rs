//! HTTP implementation of the remote store.
//!
//! Talks to the REST API:
//! - `POST|PATCH|PUT|DELETE /v1/{collection}/{id}` for writes
//! - `GET /v1/{collection}?ownerId=` polled for live queries
//! - `GET /v1/users/{uid}/care-network` and `GET|PUT /v1/users/{uid}/membership`
//!   for the permission gate
//!
//! Responses are classified into [`RemoteError`] variants here so the sync
//! engine never sees HTTP details.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::{MedSyncError, MedSyncResult};
use crate::models::{CollectionPath, EntityKind, Payload};
use crate::permissions::{CareNetwork, MembershipBackend};
use crate::remote::{DocumentRef, RemoteDocument, RemoteError, RemoteSnapshot, RemoteStore};

/// Response header carrying the server copy's modification time on conflicts
pub const SERVER_MODIFIED_HEADER: &str = "x-server-modified-at";
const API_KEY_HEADER: &str = "x-api-key";
const SNAPSHOT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipBody {
    member_ids: Vec<String>,
}

/// Map a non-success status to a classified remote error
pub fn classify_status(
    status: StatusCode,
    server_modified_at: Option<DateTime<Utc>>,
    message: String,
) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Unauthorized(message),
        404 => RemoteError::Conflict {
            server_modified_at: None,
        },
        409 | 412 => RemoteError::Conflict { server_modified_at },
        408 | 429 => RemoteError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
        400..=499 => RemoteError::Rejected(message),
        _ => RemoteError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

/// Parse a server timestamp, RFC 3339 or Unix milliseconds
pub fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Pull `error.message` out of an API error body
pub fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(String::from)
}

/// Parse a list response (`{"data": [...]}` or a bare array) into documents
pub fn parse_documents(kind: EntityKind, body: &[u8]) -> Result<Vec<RemoteDocument>, RemoteError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RemoteError::transient(format!("invalid list response: {}", e)))?;

    let items = match &value {
        serde_json::Value::Array(items) => items,
        other => other
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| RemoteError::transient("list response has no data array"))?,
    };

    let mut documents = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
            warn!("Skipping remote document without id");
            continue;
        };
        let modified_at = item
            .get("modifiedAt")
            .or_else(|| item.get("updatedAt"))
            .and_then(|v| v.as_str())
            .and_then(parse_server_timestamp);
        let bytes = serde_json::to_vec(item)
            .map_err(|e| RemoteError::transient(format!("re-encode failed: {}", e)))?;
        documents.push(RemoteDocument {
            id: id.to_string(),
            payload: Payload::from_bytes(kind, bytes),
            modified_at,
        });
    }
    Ok(documents)
}

/// REST client for the authoritative store
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpRemoteStore {
    /// Create a client. One of `api_key` or `access_token` is required.
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        access_token: Option<&str>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> MedSyncResult<Self> {
        if base_url.is_empty() {
            return Err(MedSyncError::Config("remote base_url is not set".to_string()));
        }

        let mut headers = HeaderMap::new();
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            MedSyncError::Config(format!("Invalid credential: {}", e))
        };
        match (api_key, access_token) {
            (Some(key), _) => {
                headers.insert(API_KEY_HEADER, HeaderValue::from_str(key).map_err(invalid)?);
            }
            (None, Some(token)) => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token)).map_err(invalid)?,
                );
            }
            (None, None) => {
                return Err(MedSyncError::Config(
                    "either api_key or access_token must be provided".to_string(),
                ));
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| MedSyncError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    pub fn from_config(config: &RemoteConfig) -> MedSyncResult<Self> {
        Self::new(
            &config.base_url,
            config.api_key.as_deref(),
            config.access_token.as_deref(),
            config.request_timeout(),
            config.poll_interval(),
        )
    }

    fn collection_url(&self, collection: &CollectionPath) -> String {
        let encoded: Vec<String> = collection
            .as_str()
            .split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/v1/{}", self.base_url, encoded.join("/"))
    }

    /// URL of one document
    pub fn document_url(&self, target: &DocumentRef) -> String {
        format!(
            "{}/{}",
            self.collection_url(&target.collection),
            urlencoding::encode(&target.document_id)
        )
    }

    fn user_url(&self, user_id: &str, resource: &str) -> String {
        format!(
            "{}/v1/users/{}/{}",
            self.base_url,
            urlencoding::encode(user_id),
            resource
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::transient(format!("request timed out: {}", e))
            } else {
                RemoteError::transient(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let server_modified_at = response
            .headers()
            .get(SERVER_MODIFIED_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_server_timestamp);
        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

        debug!(status = status.as_u16(), message = %message, "Remote request failed");
        Err(classify_status(status, server_modified_at, message))
    }

    async fn write(
        &self,
        method: Method,
        target: &DocumentRef,
        payload: Option<&Payload>,
    ) -> Result<(), RemoteError> {
        let mut request = self.client.request(method, self.document_url(target));
        if let Some(payload) = payload {
            request = request.body(payload.bytes.clone());
        }
        self.send(request).await.map(|_| ())
    }

    async fn fetch_collection(
        &self,
        collection: &CollectionPath,
        owner_id: &str,
        kind: EntityKind,
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        let request = self
            .client
            .get(self.collection_url(collection))
            .query(&[("ownerId", owner_id)]);
        let response = self.send(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::transient(format!("failed to read body: {}", e)))?;
        parse_documents(kind, &body)
    }
}

/// A 404 on a lookup means "nothing stored yet"
fn absent_as_none<T>(result: Result<T, RemoteError>) -> Result<Option<T>, RemoteError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RemoteError::Conflict {
            server_modified_at: None,
        }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError> {
        self.write(Method::POST, target, Some(payload)).await
    }

    async fn update(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError> {
        self.write(Method::PATCH, target, Some(payload)).await
    }

    async fn delete(&self, target: &DocumentRef) -> Result<(), RemoteError> {
        self.write(Method::DELETE, target, None).await
    }

    async fn overwrite(
        &self,
        target: &DocumentRef,
        payload: Option<&Payload>,
    ) -> Result<(), RemoteError> {
        match payload {
            Some(payload) => self.write(Method::PUT, target, Some(payload)).await,
            None => match self.write(Method::DELETE, target, None).await {
                Err(RemoteError::Conflict { .. }) => Ok(()),
                other => other,
            },
        }
    }

    async fn subscribe(
        &self,
        collection: &CollectionPath,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<RemoteSnapshot>, RemoteError> {
        let kind = EntityKind::from_str(collection.name()).ok_or_else(|| {
            RemoteError::Rejected(format!("no entity kind for collection {}", collection))
        })?;

        // First fetch runs inline so authorization failures reach the caller
        let initial = self.fetch_collection(collection, owner_id, kind).await?;

        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let store = self.clone();
        let collection = collection.clone();
        let owner_id = owner_id.to_string();

        tokio::spawn(async move {
            let mut last = initial;
            let snapshot = RemoteSnapshot {
                collection: collection.clone(),
                owner_id: owner_id.clone(),
                documents: last.clone(),
            };
            if tx.send(snapshot).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.fetch_collection(&collection, &owner_id, kind).await {
                    Ok(documents) if documents == last => {}
                    Ok(documents) => {
                        last = documents;
                        let snapshot = RemoteSnapshot {
                            collection: collection.clone(),
                            owner_id: owner_id.clone(),
                            documents: last.clone(),
                        };
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(collection = %collection, error = %e, "Live query poll failed");
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!(collection = %collection, "Live query closed");
        });

        Ok(rx)
    }
}

#[async_trait]
impl MembershipBackend for HttpRemoteStore {
    async fn load_care_network(&self, user_id: &str) -> Result<CareNetwork, RemoteError> {
        let request = self.client.get(self.user_url(user_id, "care-network"));
        let response = absent_as_none(self.send(request).await)?;
        match response {
            Some(response) => response
                .json::<CareNetwork>()
                .await
                .map_err(|e| RemoteError::transient(format!("invalid care network: {}", e))),
            None => Ok(CareNetwork::default()),
        }
    }

    async fn stored_membership(&self, user_id: &str) -> Result<Option<Vec<String>>, RemoteError> {
        let request = self.client.get(self.user_url(user_id, "membership"));
        let Some(response) = absent_as_none(self.send(request).await)? else {
            return Ok(None);
        };
        let body = response
            .json::<MembershipBody>()
            .await
            .map_err(|e| RemoteError::transient(format!("invalid membership: {}", e)))?;
        Ok(Some(body.member_ids))
    }

    async fn write_membership(
        &self,
        user_id: &str,
        member_ids: &[String],
    ) -> Result<(), RemoteError> {
        let body = MembershipBody {
            member_ids: member_ids.to_vec(),
        };
        let request = self
            .client
            .put(self.user_url(user_id, "membership"))
            .json(&body);
        self.send(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HttpRemoteStore {
        HttpRemoteStore::new(
            "https://api.example.com/",
            Some("key"),
            None,
            Duration::from_secs(30),
            Duration::from_secs(15),
        )
        .unwrap()
    }

    #[test]
    fn test_classify_status() {
        let ts = Some(Utc::now());
        let msg = || "boom".to_string();

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, msg()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, msg()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, msg()),
            RemoteError::Rejected(_)
        ));
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, ts, msg()),
            RemoteError::Conflict {
                server_modified_at: None
            }
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT, ts, msg()),
            RemoteError::Conflict {
                server_modified_at: ts
            }
        );
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, None, msg()).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None, msg()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, msg()).is_retryable());
    }

    #[test]
    fn test_parse_server_timestamp() {
        let rfc = parse_server_timestamp("2024-03-01T10:00:00Z").unwrap();
        assert_eq!(rfc.timestamp(), 1_709_287_200);

        let millis = parse_server_timestamp("1709287200000").unwrap();
        assert_eq!(millis, rfc);

        assert!(parse_server_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_extract_error_message() {
        let body = r#"{"error": {"code": "invalid", "message": "name is required"}}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("name is required"));
        assert!(extract_error_message("<html>").is_none());
        assert!(extract_error_message(r#"{"error": "flat"}"#).is_none());
    }

    #[test]
    fn test_document_url_encodes_segments() {
        let collection = CollectionPath::for_owner("user 1", EntityKind::Medication).unwrap();
        let url = store().document_url(&DocumentRef::new(collection, "med#1"));
        assert_eq!(
            url,
            "https://api.example.com/v1/users/user%201/medications/med%231"
        );
    }

    #[test]
    fn test_parse_documents() {
        let body = br#"{"data": [
            {"id": "m1", "name": "Metformin", "updatedAt": "2024-03-01T10:00:00Z"},
            {"name": "no id"},
            {"id": "m2"}
        ], "pagination": {}}"#;
        let docs = parse_documents(EntityKind::Medication, body).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "m1");
        assert!(docs[0].modified_at.is_some());
        assert!(docs[1].modified_at.is_none());

        let value: serde_json::Value = docs[0].payload.decode().unwrap();
        assert_eq!(value["name"], "Metformin");

        let bare = parse_documents(EntityKind::Medication, br#"[{"id": "x"}]"#).unwrap();
        assert_eq!(bare.len(), 1);
    }

    #[test]
    fn test_credentials_required() {
        let result = HttpRemoteStore::new(
            "https://api.example.com",
            None,
            None,
            Duration::from_secs(30),
            Duration::from_secs(15),
        );
        assert!(matches!(result, Err(MedSyncError::Config(_))));
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let config = RemoteConfig {
            access_token: Some("token".to_string()),
            ..Default::default()
        };
        assert!(HttpRemoteStore::from_config(&config).is_err());
    }
}
