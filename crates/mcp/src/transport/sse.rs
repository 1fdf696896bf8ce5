//! Server-Sent Events adapter and frame parser.
//!
//! Requests are POSTed to the backend; responses arrive on a long-lived event
//! stream and are matched to waiters by `id`. The listener reconnects with a
//! doubling backoff and resends `Last-Event-ID`, and marks the transport
//! closed after repeated failed reconnects. An `endpoint` event moves the POST
//! target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anywhere_types::WireTransport;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{Message, Notification, Request};
use crate::transport::http::spawn_cancel_notice;
use crate::transport::{PendingCalls, Transport, TransportError, TransportOptions};

/// Backoff between event-stream reconnects, and how many consecutive
/// failures end the transport.
#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    initial_backoff: Duration,
    max_backoff: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

/// Event-stream adapter.
pub struct SseTransport {
    backend_id: String,
    client: Client,
    post_url: Arc<RwLock<Url>>,
    pending: Arc<PendingCalls>,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    options: TransportOptions,
}

impl SseTransport {
    /// Subscribes to the event stream and returns once it is connected, or
    /// after `call_timeout` if the first connection attempt keeps failing.
    ///
    /// When the stream is served from the POST URL itself, the backend is
    /// expected to announce its message endpoint first; `connect` waits up
    /// to `call_timeout` for that `endpoint` event.
    pub async fn connect(
        backend_id: impl Into<String>,
        url: Url,
        events_url: Option<Url>,
        headers: HeaderMap,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let backend_id = backend_id.into();
        // No client-wide timeout: it would also cut the long-lived event stream.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(options.call_timeout)
            .build()
            .map_err(|error| TransportError::io(format!("Failed to create HTTP client: {error}")))?;

        let events_url = events_url.unwrap_or_else(|| default_events_url(&url));
        let expects_endpoint = events_url == url;
        let post_url = Arc::new(RwLock::new(url));
        let pending = PendingCalls::new();
        let open = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let listener = spawn_sse_listener(
            ListenerContext {
                backend_id: backend_id.clone(),
                client: client.clone(),
                events_url,
                post_url: Arc::clone(&post_url),
                pending: Arc::clone(&pending),
                open: Arc::clone(&open),
                shutdown: shutdown.clone(),
                connect_timeout: options.call_timeout,
                policy: ReconnectPolicy::default(),
            },
            ready_tx,
            endpoint_tx,
        );

        match tokio::time::timeout(options.call_timeout, ready_rx).await {
            Ok(Ok(())) => {
                if expects_endpoint && tokio::time::timeout(options.call_timeout, endpoint_rx).await.is_err() {
                    warn!(target: "mcp_http_sse", backend = %backend_id, "No endpoint event received; posting to the stream URL");
                }
            }
            Ok(Err(_)) if !open.load(Ordering::SeqCst) => {
                shutdown.cancel();
                return Err(TransportError::io("event stream unavailable"));
            }
            _ => warn!(target: "mcp_http_sse", backend = %backend_id, "Event stream not connected yet; continuing"),
        }

        Ok(Self {
            backend_id,
            client,
            post_url,
            pending,
            open,
            shutdown,
            listener: std::sync::Mutex::new(Some(listener)),
            options,
        })
    }

    fn current_post_url(&self) -> Url {
        self.post_url
            .read()
            .map(|url| url.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn post(&self, body: Value) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.current_post_url())
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.options.call_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| TransportError::io(format!("HTTP POST failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        // Some servers answer inline instead of on the stream.
        if let Ok(text) = response.text().await
            && let Ok(value) = serde_json::from_str::<Value>(&text)
            && let Ok(Message::Response(inline)) = Message::parse(value)
        {
            self.pending.resolve(inline);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn call(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let id = self.pending.next_id();
        let waiter = self.pending.register(&id)?;
        let request = Request::new(id.clone(), method, params);
        let body = serde_json::to_value(&request).map_err(|error| TransportError::protocol(error.to_string()))?;

        // One deadline covers both the POST and the wait for the pushed reply.
        let timeout = self.options.call_timeout;
        let timed_out = || TransportError::Timeout {
            method: method.to_string(),
            timeout,
        };
        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = self.shutdown.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(timed_out()),
            sent = self.post(body) => sent,
        };
        let outcome = match sent {
            Ok(()) => waiter
                .wait(method, timeout.saturating_sub(started.elapsed()), cancel)
                .await
                .map_err(|error| match error {
                    TransportError::Timeout { .. } => timed_out(),
                    other => other,
                }),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(response) => response.into_result().map_err(TransportError::Remote),
            Err(error @ (TransportError::Cancelled | TransportError::Timeout { .. })) => {
                if self.is_open() {
                    spawn_cancel_notice(self.backend_id.clone(), self.client.clone(), self.current_post_url(), None, &id);
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
        self.post(body).await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending.close_all(|| TransportError::Cancelled);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = listener {
            handle.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn kind(&self) -> WireTransport {
        WireTransport::Sse
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// `{url}/events`, keeping the base path. A URL ending in `/sse` is itself
/// the event stream.
fn default_events_url(url: &Url) -> Url {
    if url.path_segments().and_then(|mut segments| segments.next_back()) == Some("sse") {
        return url.clone();
    }
    let mut events = url.clone();
    if let Ok(mut segments) = events.path_segments_mut() {
        segments.pop_if_empty().push("events");
    }
    events
}

struct ListenerContext {
    backend_id: String,
    client: Client,
    events_url: Url,
    post_url: Arc<RwLock<Url>>,
    pending: Arc<PendingCalls>,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
}

fn spawn_sse_listener(
    listener: ListenerContext,
    ready: oneshot::Sender<()>,
    endpoint: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ListenerContext {
            backend_id,
            client,
            events_url,
            post_url,
            pending,
            open,
            shutdown,
            connect_timeout,
            policy,
        } = listener;
        let mut ready = Some(ready);
        let mut endpoint = Some(endpoint);
        let mut last_event_id: Option<String> = None;
        let mut backoff = policy.initial_backoff;
        let mut failures = 0u32;

        while !shutdown.is_cancelled() {
            let mut request = client.get(events_url.clone()).header(ACCEPT, "text/event-stream");
            if let Some(id) = &last_event_id {
                request = request.header("Last-Event-ID", id);
            }

            match tokio::time::timeout(connect_timeout, request.send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    backoff = policy.initial_backoff;
                    failures = 0;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                    let mut stream = Box::pin(response.bytes_stream());
                    let mut context = StreamContext {
                        backend_id: &backend_id,
                        post_url: &post_url,
                        pending: &pending,
                        last_event_id: &mut last_event_id,
                        endpoint: &mut endpoint,
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        outcome = process_sse_stream(&mut stream, &mut context) => {
                            if let Err(error) = outcome {
                                warn!(target: "mcp_http_sse", backend = %backend_id, "SSE stream error: {}", error);
                            }
                        }
                    }
                }
                Ok(Ok(response)) => {
                    failures += 1;
                    warn!(target: "mcp_http_sse", backend = %backend_id, "SSE request failed: {}", response.status());
                }
                Ok(Err(error)) => {
                    failures += 1;
                    warn!(target: "mcp_http_sse", backend = %backend_id, "SSE connect error: {}", error);
                }
                Err(_) => {
                    failures += 1;
                    warn!(target: "mcp_http_sse", backend = %backend_id, "SSE connect timed out after {}ms", connect_timeout.as_millis());
                }
            }

            if failures >= policy.max_attempts {
                warn!(target: "mcp_http_sse", backend = %backend_id, "Giving up on event stream after {} attempts", failures);
                open.store(false, Ordering::SeqCst);
                pending.close_all(|| TransportError::io("event stream unavailable"));
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(policy.max_backoff);
        }
        debug!(target: "mcp_http_sse", backend = %backend_id, "SSE listener stopped");
    })
}

struct StreamContext<'a> {
    backend_id: &'a str,
    post_url: &'a RwLock<Url>,
    pending: &'a PendingCalls,
    last_event_id: &'a mut Option<String>,
    /// Fired once, on the first `endpoint` event.
    endpoint: &'a mut Option<oneshot::Sender<()>>,
}

async fn process_sse_stream<S, B, E>(stream: &mut S, context: &mut StreamContext<'_>) -> Result<(), String>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut buf = Vec::<u8>::new();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|error| error.to_string())?;
        buf.extend_from_slice(bytes.as_ref());

        while let Some(end) = find_frame_end(&buf) {
            if let Ok(text) = std::str::from_utf8(&buf[..end])
                && let Some(frame) = parse_sse_frame(text)
            {
                if let Some(id) = &frame.id {
                    *context.last_event_id = Some(id.clone());
                }
                handle_frame(frame, context);
            }
            let separator = find_separator_len(&buf[end..]);
            buf.drain(..end + separator);
        }
    }
    Ok(())
}

fn handle_frame(frame: SseFrame, context: &mut StreamContext<'_>) {
    let Some(data) = frame.data else {
        return;
    };

    if frame.event.as_deref() == Some("endpoint") {
        let relocated = {
            let mut post_url = context.post_url.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            match post_url.join(data.trim()) {
                Ok(relocated) => {
                    debug!(target: "mcp_http_sse", backend = %context.backend_id, "POST endpoint moved to {}", relocated);
                    *post_url = relocated;
                    true
                }
                Err(error) => {
                    warn!(target: "mcp_http_sse", backend = %context.backend_id, "Invalid endpoint event: {}", error);
                    false
                }
            }
        };
        if relocated && let Some(signal) = context.endpoint.take() {
            let _ = signal.send(());
        }
        return;
    }

    match serde_json::from_str::<Value>(&data).map(Message::parse) {
        Ok(Ok(Message::Response(response))) => {
            if !context.pending.resolve(response) {
                debug!(target: "mcp_http_sse", backend = %context.backend_id, "Unmatched SSE response");
            }
        }
        Ok(Ok(message)) => {
            debug!(target: "mcp_http_sse", backend = %context.backend_id, "Ignoring SSE message: {:?}", message);
        }
        Ok(Err(error)) => {
            debug!(target: "mcp_http_sse", backend = %context.backend_id, "Malformed SSE envelope: {}", error);
        }
        Err(_) => {
            debug!(target: "mcp_http_sse", backend = %context.backend_id, "Received non-JSON SSE data: {}", data);
        }
    }
}

/// Finds the end of the first SSE frame in the buffer.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| buf[i..].starts_with(b"\n\n") || buf[i..].starts_with(b"\r\n\r\n"))
}

fn find_separator_len(slice: &[u8]) -> usize {
    if slice.starts_with(b"\n\n") {
        2
    } else if slice.starts_with(b"\r\n\r\n") {
        4
    } else {
        0
    }
}

/// A single parsed SSE frame.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SseFrame {
    pub data: Option<String>,
    pub id: Option<String>,
    pub event: Option<String>,
}

pub(crate) fn parse_sse_frame(frame_text: &str) -> Option<SseFrame> {
    let mut data_lines = Vec::new();
    let mut frame = SseFrame::default();

    for line in frame_text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    (frame != SseFrame::default()).then_some(frame)
}

/// Splits a complete event-stream body into frames.
pub(crate) fn parse_sse_body(body: &str) -> Vec<SseFrame> {
    body.replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(parse_sse_frame)
        .collect()
}
