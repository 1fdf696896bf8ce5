//! Newline-delimited JSON over a session's pipes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anywhere_types::WireTransport;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logging::{LogLevel, LogManager, LogSource};
use crate::protocol::{ErrorObject, Message, Notification, Request, Response};
use crate::transport::{PendingCalls, Transport, TransportError, TransportOptions};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;

/// Pipe adapter bound to a backend's stdin and stdout.
pub struct StdioTransport {
    backend_id: String,
    writer: SharedWriter,
    pending: Arc<PendingCalls>,
    open: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    options: TransportOptions,
}

impl StdioTransport {
    /// Starts reading `reader` in the background and returns the adapter.
    pub fn connect(backend_id: impl Into<String>, reader: BoxedReader, writer: BoxedWriter, options: TransportOptions) -> Self {
        let backend_id = backend_id.into();
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
        let pending = PendingCalls::new();
        let open = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            backend_id.clone(),
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&open),
            options.diagnostics.clone(),
        ));

        Self {
            backend_id,
            writer,
            pending,
            open,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            options,
        }
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        write_line(&self.writer, message).await
    }
}

async fn write_line<T: Serialize>(writer: &SharedWriter, message: &T) -> Result<(), TransportError> {
    let mut line = serde_json::to_string(message).map_err(|error| TransportError::protocol(error.to_string()))?;
    line.push('\n');

    let mut guard = writer.lock().await;
    let writer = guard.as_mut().ok_or(TransportError::Closed)?;
    writer.write_all(line.as_bytes()).await.map_err(TransportError::io)?;
    writer.flush().await.map_err(TransportError::io)
}

async fn read_loop(
    backend_id: String,
    reader: BoxedReader,
    writer: SharedWriter,
    pending: Arc<PendingCalls>,
    open: Arc<AtomicBool>,
    diagnostics: Option<Arc<LogManager>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(Value::Array(batch)) => {
                        for value in batch {
                            dispatch(&backend_id, value, &writer, &pending).await;
                        }
                    }
                    Ok(value) => dispatch(&backend_id, value, &writer, &pending).await,
                    Err(_) => {
                        warn!(backend = %backend_id, "Skipping non-protocol output on stdout");
                        if let Some(diagnostics) = &diagnostics {
                            diagnostics.record(&backend_id, LogLevel::Warn, LogSource::Stdout, trimmed);
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(backend = %backend_id, "Failed to read backend stdout: {}", error);
                break;
            }
        }
    }

    debug!(backend = %backend_id, "Backend output stream ended");
    open.store(false, Ordering::SeqCst);
    pending.close_all(|| TransportError::Io {
        message: "backend output stream ended".to_string(),
    });
}

async fn dispatch(backend_id: &str, value: Value, writer: &SharedWriter, pending: &PendingCalls) {
    match Message::parse(value) {
        Ok(Message::Response(response)) => {
            if !pending.resolve(response) {
                debug!(backend = %backend_id, "Dropping response with no waiter");
            }
        }
        Ok(Message::Request(request)) => {
            debug!(backend = %backend_id, "Rejecting server request '{}'", request.method);
            let reply = Response::failure(Some(request.id), ErrorObject::method_not_found(&request.method));
            if let Err(error) = write_line(writer, &reply).await {
                debug!(backend = %backend_id, "Could not answer server request: {}", error);
            }
        }
        Ok(Message::Notification(notification)) => {
            debug!(backend = %backend_id, "Notification from backend: {}", notification.method);
        }
        Err(error) => {
            warn!(backend = %backend_id, "Ignoring malformed envelope: {}", error);
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn call(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, TransportError> {
        let id = self.pending.next_id();
        let waiter = self.pending.register(&id)?;
        self.send(&Request::new(id.clone(), method, params)).await?;

        match waiter.wait(method, self.options.call_timeout, cancel).await {
            Ok(response) => response.into_result().map_err(TransportError::Remote),
            Err(error @ (TransportError::Cancelled | TransportError::Timeout { .. })) => {
                let reason = if matches!(error, TransportError::Cancelled) {
                    "client cancelled"
                } else {
                    "timed out"
                };
                let notice = Notification::new("notifications/cancelled", Some(json!({ "requestId": id, "reason": reason })));
                if let Err(send_error) = self.send(&notice).await {
                    debug!(backend = %self.backend_id, "Could not forward cancellation: {}", send_error);
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&Notification::new(method, params)).await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.pending.close_all(|| TransportError::Cancelled);

        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reader_task {
            handle.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.pending.is_closed()
    }

    fn kind(&self) -> WireTransport {
        WireTransport::Pipe
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let reader_task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reader_task {
            handle.abort();
        }
    }
}

/// Forwards every stderr line of a backend into the diagnostic sink.
pub fn spawn_stderr_pump(backend_id: String, stderr: BoxedReader, diagnostics: Arc<LogManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            diagnostics.record(&backend_id, LogLevel::Info, LogSource::Stderr, line);
        }
    })
}
