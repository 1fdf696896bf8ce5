//! One POST per call.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anywhere_types::WireTransport;
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::protocol::{Message, Notification, Request, RequestId, Response};
use crate::transport::sse::parse_sse_body;
use crate::transport::{Transport, TransportError, TransportOptions};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Upper bound for best-effort messages sent after a call gave up
/// (`notifications/cancelled`, session DELETE).
pub(crate) const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streamable-HTTP style adapter.
///
/// Holds no connection state beyond reqwest's pool and the session id the
/// backend hands out on `initialize`.
pub struct HttpTransport {
    backend_id: String,
    client: Client,
    url: Url,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
    open: AtomicBool,
    closed: CancellationToken,
    options: TransportOptions,
}

/// Builds a header map from configured headers, skipping invalid entries.
pub fn build_headers(headers: &IndexMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!("Skipping invalid header '{}'", key),
        }
    }
    map
}

impl HttpTransport {
    pub fn new(backend_id: impl Into<String>, url: Url, headers: HeaderMap, options: TransportOptions) -> Result<Self, TransportError> {
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(options.call_timeout)
            .timeout(options.call_timeout)
            .build()
            .map_err(|error| TransportError::io(format!("Failed to create HTTP client: {error}")))?;
        Ok(Self {
            backend_id: backend_id.into(),
            client,
            url,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            options,
        })
    }

    /// Session id assigned by the backend, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn post(&self, body: Value, expect: Option<&RequestId>) -> Result<Option<Response>, TransportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|error| TransportError::io(format!("HTTP POST failed: {error}")))?;

        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|value| value.to_str().ok()) {
            let mut guard = self.session_id.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(session.to_string());
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        let text = response.text().await.map_err(TransportError::io)?;

        let Some(expected) = expect else {
            return Ok(None);
        };
        let response = if is_event_stream {
            find_response_in_event_stream(&text, expected)
        } else {
            find_response_in_json(&text, expected)?
        };
        response
            .map(Some)
            .ok_or_else(|| TransportError::protocol(format!("no response for request {expected} in HTTP body")))
    }
}

/// Tells the backend a call was abandoned, on a detached task bounded by
/// [`NOTICE_TIMEOUT`] so a dead backend cannot hold up the caller.
pub(crate) fn spawn_cancel_notice(backend_id: String, client: Client, url: Url, session: Option<String>, id: &RequestId) {
    let notice = Notification::new("notifications/cancelled", Some(json!({ "requestId": id })));
    tokio::spawn(async move {
        let mut request = client
            .post(url)
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(NOTICE_TIMEOUT)
            .json(&notice);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        match tokio::time::timeout(NOTICE_TIMEOUT, request.send()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => debug!(backend = %backend_id, "Could not forward cancellation: {}", error),
            Err(_) => debug!(backend = %backend_id, "Cancellation notice timed out"),
        }
    });
}

fn matches_id(response: &Response, expected: &RequestId) -> bool {
    response
        .id
        .as_ref()
        .is_some_and(|id| id.correlation_key() == expected.correlation_key())
}

fn find_response_in_json(text: &str, expected: &RequestId) -> Result<Option<Response>, TransportError> {
    let value: Value = serde_json::from_str(text).map_err(|error| TransportError::protocol(format!("invalid JSON body: {error}")))?;
    let candidates = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    Ok(candidates.into_iter().find_map(|candidate| match Message::parse(candidate) {
        Ok(Message::Response(response)) if matches_id(&response, expected) => Some(response),
        _ => None,
    }))
}

fn find_response_in_event_stream(text: &str, expected: &RequestId) -> Option<Response> {
    parse_sse_body(text).into_iter().find_map(|frame| {
        let value = serde_json::from_str::<Value>(frame.data.as_deref()?).ok()?;
        match Message::parse(value).ok()? {
            Message::Response(response) if matches_id(&response, expected) => Some(response),
            _ => None,
        }
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = serde_json::to_value(Request::new(id.clone(), method, params))
            .map_err(|error| TransportError::protocol(error.to_string()))?;

        // The client timeout is only a backstop; this timer reports the expiry.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = self.closed.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(self.options.call_timeout) => Err(TransportError::Timeout {
                method: method.to_string(),
                timeout: self.options.call_timeout,
            }),
            outcome = self.post(body, Some(&id)) => outcome,
        };

        match outcome {
            Ok(Some(response)) => response.into_result().map_err(TransportError::Remote),
            Ok(None) => Err(TransportError::protocol(format!("backend accepted '{method}' without a response"))),
            Err(error @ (TransportError::Cancelled | TransportError::Timeout { .. })) => {
                if self.is_open() {
                    spawn_cancel_notice(
                        self.backend_id.clone(),
                        self.client.clone(),
                        self.url.clone(),
                        self.session_id(),
                        &id,
                    );
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let body = serde_json::to_value(Notification::new(method, params))
            .map_err(|error| TransportError::protocol(error.to_string()))?;
        self.post(body, None).await.map(|_| ())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.cancel();
            if let Some(session) = self.session_id() {
                let request = self
                    .client
                    .delete(self.url.clone())
                    .header(SESSION_HEADER, session)
                    .timeout(NOTICE_TIMEOUT)
                    .send();
                if tokio::time::timeout(NOTICE_TIMEOUT, request).await.is_err() {
                    debug!(backend = %self.backend_id, "Session DELETE timed out");
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn kind(&self) -> WireTransport {
        WireTransport::Http
    }
}
