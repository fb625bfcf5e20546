//! HTTP transport to the authoritative server.
//!
//! # Status Mapping
//!
//! | Response | Error |
//! |----------|-------|
//! | connect/timeout/body failure | `Transport` (retryable) |
//! | 5xx, 408, 429 | `Transport` (retryable) |
//! | 401, 403 | `Auth` (controller pauses for new credentials) |
//! | 400, 422 on push | `Validation` (row rejected permanently) |
//! | other 4xx on pull | `Codec` (the request itself is malformed) |
//!
//! The request timeout applies to pull and push only. The live stream is a
//! long-lived response and is bounded by the connect timeout alone.

use super::{BoxFuture, LiveFeed, RemoteEndpoint, SseDecoder, TokenProvider, LIVE_CHANNEL_CAPACITY};
use crate::batch::{encode_push_body, ChangeBatch, ChangeRow, PullRequest, PushResponse};
use crate::checkpoint::Checkpoint;
use crate::config::RemoteConfig;
use crate::document::{Collection, Document};
use crate::error::{ReplicationError, Result};
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`RemoteEndpoint`] over HTTP + Server-Sent Events.
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    account_id: String,
    token: Arc<dyn TokenProvider>,
    request_timeout: Duration,
    live_push: bool,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig, account_id: impl Into<String>, token: Arc<dyn TokenProvider>) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ReplicationError::Config(format!("Invalid remote base_url {:?}: {}", config.base_url, e)))?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ReplicationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            account_id: account_id.into(),
            token,
            request_timeout: config.request_timeout_duration(),
            live_push: config.live_push,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ReplicationError::Config(format!("Invalid endpoint path {:?}: {}", path, e)))
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token.token().await?;
        Ok(builder.header(AUTHORIZATION, format!("Bearer {}", token)))
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response> {
        self.authorized(builder)
            .await?
            .send()
            .await
            .map_err(|e| ReplicationError::transport(operation, e))
    }

    async fn read_json(operation: &str, response: Response) -> Result<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|e| {
                if e.is_decode() {
                    ReplicationError::Codec(format!("{}: invalid JSON body: {}", operation, e))
                } else {
                    ReplicationError::transport(operation, e)
                }
            })
    }
}

/// Map a non-success status to the error taxonomy.
fn classify_status(
    operation: &str,
    status: StatusCode,
    body: String,
    rejected: Option<(Collection, &str)>,
) -> ReplicationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ReplicationError::Auth(format!("{} returned {}", operation, status))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ReplicationError::transport_msg(operation, format!("HTTP {}", status))
        }
        s if s.is_server_error() => ReplicationError::transport_msg(operation, format!("HTTP {}: {}", status, body)),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY if rejected.is_some() => {
            let (collection, document_id) = rejected.unwrap_or((Collection::Messages, ""));
            ReplicationError::Validation {
                collection,
                document_id: document_id.to_string(),
                message: if body.is_empty() { status.to_string() } else { body },
            }
        }
        _ => ReplicationError::Codec(format!("{} returned {}: {}", operation, status, body)),
    }
}

async fn error_for(operation: &str, response: Response, rejected: Option<(Collection, &str)>) -> ReplicationError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(operation, status, body, rejected)
}

impl RemoteEndpoint for HttpRemote {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn pull<'a>(&'a self, collection: Collection, request: &'a PullRequest) -> BoxFuture<'a, ChangeBatch> {
        Box::pin(async move {
            let operation = format!("pull {}", collection);
            let url = self.url(collection.pull_path())?;
            let builder = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .query(&request.query_pairs(collection))
                .timeout(self.request_timeout);

            let response = self.send(&operation, builder).await?;
            if !response.status().is_success() {
                return Err(error_for(&operation, response, None).await);
            }

            let body = Self::read_json(&operation, response).await?;
            let batch = ChangeBatch::decode(collection, &self.account_id, &body, &request.since())?;
            debug!(%collection, documents = batch.len(), "Pulled batch");
            Ok(batch)
        })
    }

    fn push<'a>(&'a self, collection: Collection, rows: &'a [ChangeRow]) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let operation = format!("push {}", collection);
            let path = collection.push_path().ok_or_else(|| ReplicationError::Validation {
                collection,
                document_id: String::new(),
                message: "collection has no push endpoint".to_string(),
            })?;
            let url = self.url(path)?;
            let builder = self
                .client
                .post(url)
                .header(ACCEPT, "application/json")
                .json(&encode_push_body(collection, rows))
                .timeout(self.request_timeout);

            let response = self.send(&operation, builder).await?;
            if !response.status().is_success() {
                // Only a single-row push can name the offending document.
                let document_id = match rows {
                    [only] => only.new_document_state.id.as_str(),
                    _ => "",
                };
                return Err(error_for(&operation, response, Some((collection, document_id))).await);
            }

            let body = Self::read_json(&operation, response).await?;
            Ok(PushResponse::decode(collection, &self.account_id, &body)?.conflicts)
        })
    }

    fn subscribe(&self, collection: Collection) -> BoxFuture<'_, Option<LiveFeed>> {
        Box::pin(async move {
            let Some(path) = collection.live_path() else {
                return Ok(None);
            };
            if !self.live_push {
                return Ok(None);
            }

            let operation = format!("subscribe {}", collection);
            let url = self.url(path)?;
            let builder = self.client.get(url);
            let response = self
                .authorized(builder)
                .await?
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| ReplicationError::transport(&operation, e))?;
            if !response.status().is_success() {
                return Err(error_for(&operation, response, None).await);
            }

            let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
            let account_id = self.account_id.clone();
            let task = tokio::spawn(read_event_stream(collection, account_id, operation, response, tx));
            Ok(Some(LiveFeed::new(rx, task)))
        })
    }
}

/// Pump an SSE response into the feed channel until it ends or fails.
async fn read_event_stream(
    collection: Collection,
    account_id: String,
    operation: String,
    response: Response,
    tx: mpsc::Sender<Result<ChangeBatch>>,
) {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let payloads = match chunk {
            Ok(bytes) => decoder.feed(&bytes),
            Err(e) => {
                warn!(%collection, error = %e, "Live stream failed");
                let _ = tx.send(Err(ReplicationError::transport(&operation, e))).await;
                return;
            }
        };
        for payload in payloads {
            if tx.send(decode_live_payload(collection, &account_id, &payload)).await.is_err() {
                return;
            }
        }
    }

    for payload in decoder.finish() {
        if tx.send(decode_live_payload(collection, &account_id, &payload)).await.is_err() {
            return;
        }
    }
    debug!(%collection, "Live stream closed by server");
}

/// Decode one live event: a change batch body whose checkpoint is the
/// largest cursor it contains.
pub(crate) fn decode_live_payload(collection: Collection, account_id: &str, payload: &str) -> Result<ChangeBatch> {
    let body: Value = serde_json::from_str(payload)?;
    let mut batch = ChangeBatch::decode(collection, account_id, &body, &Checkpoint::origin())?;
    batch.sort();
    if let Some(max) = batch.max_checkpoint() {
        if max > batch.checkpoint {
            batch.checkpoint = max;
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SharedToken;
    use serde_json::json;

    #[test]
    fn test_classify_auth() {
        let err = classify_status("pull messages", StatusCode::UNAUTHORIZED, String::new(), None);
        assert!(err.is_auth());
        let err = classify_status("push messages", StatusCode::FORBIDDEN, String::new(), Some((Collection::Messages, "m")));
        assert!(err.is_auth());
    }

    #[test]
    fn test_classify_server_errors_retryable() {
        for status in [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY, StatusCode::TOO_MANY_REQUESTS] {
            let err = classify_status("pull tags", status, "boom".into(), None);
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn test_classify_push_validation() {
        let err = classify_status(
            "push contacts",
            StatusCode::UNPROCESSABLE_ENTITY,
            "bad email".into(),
            Some((Collection::Contacts, "p-1")),
        );
        match err {
            ReplicationError::Validation {
                collection,
                document_id,
                message,
            } => {
                assert_eq!(collection, Collection::Contacts);
                assert_eq!(document_id, "p-1");
                assert_eq!(message, "bad email");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_pull_bad_request_is_codec() {
        let err = classify_status("pull messages", StatusCode::BAD_REQUEST, String::new(), None);
        assert!(matches!(err, ReplicationError::Codec(_)));
    }

    #[test]
    fn test_decode_live_payload_uses_max_cursor() {
        let payload = json!({
            "threads": [
                {"threadId": "t-2", "updatedAt": "2025-01-01T00:00:02Z"},
                {"threadId": "t-1", "updatedAt": "2025-01-01T00:00:01Z"}
            ],
            "checkpoint": {"threadId": "t-1", "updatedAt": "2025-01-01T00:00:01Z"}
        })
        .to_string();
        let batch = decode_live_payload(Collection::Threads, "acct", &payload).unwrap();
        assert_eq!(batch.documents[0].id, "t-1");
        assert_eq!(batch.checkpoint.key, "t-2");
        assert_eq!(batch.documents[1].account_id, "acct");
    }

    #[test]
    fn test_new_rejects_bad_base_url() {
        let config = RemoteConfig {
            base_url: "not a url".into(),
            ..RemoteConfig::default()
        };
        let token: Arc<dyn TokenProvider> = Arc::new(SharedToken::new("t"));
        assert!(HttpRemote::new(&config, "acct", token).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_without_live_path_is_none() {
        let token: Arc<dyn TokenProvider> = Arc::new(SharedToken::new("t"));
        let remote = HttpRemote::new(&RemoteConfig::default(), "acct", token).unwrap();
        assert!(remote.subscribe(Collection::Contacts).await.unwrap().is_none());
        assert!(remote.url("messages/pull").unwrap().as_str().ends_with("/api/messages/pull"));
    }
}
