//! Transport adapters between the gateway and its backends.
//!
//! Every adapter offers the same surface: correlated `call`, fire-and-forget
//! `notify`, and a `close` that resolves outstanding waiters with
//! [`TransportError::Cancelled`]. Three carriers exist:
//!
//! - [`StdioTransport`]: newline-delimited JSON over a session's pipes.
//! - [`HttpTransport`]: one POST per call.
//! - [`SseTransport`]: POST for requests, responses pushed on an event stream.

mod http;
mod pending;
mod sse;
mod stdio;

use std::sync::Arc;
use std::time::Duration;

use anywhere_types::WireTransport;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::logging::LogManager;
use crate::protocol::{ErrorObject, codes};

pub use http::{HttpTransport, build_headers};
pub use pending::{PendingCall, PendingCalls};
pub use sse::SseTransport;
pub use stdio::{BoxedReader, BoxedWriter, StdioTransport, spawn_stderr_pump};

/// A connected carrier to one backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for its correlated response.
    ///
    /// Resolves with the backend's `result`, or with
    /// [`TransportError::Remote`] when the backend answered with an error.
    async fn call(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, TransportError>;

    /// Sends a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Cancels every outstanding waiter and releases the carrier. Idempotent.
    async fn close(&self);

    fn is_open(&self) -> bool;

    fn kind(&self) -> WireTransport;
}

/// Options shared by all adapters.
#[derive(Clone)]
pub struct TransportOptions {
    /// Upper bound on a single call.
    pub call_timeout: Duration,
    /// Receives non-protocol output and stderr lines.
    pub diagnostics: Option<Arc<LogManager>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            diagnostics: None,
        }
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("call_timeout", &self.call_timeout)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

/// Adapter-level call failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("call '{method}' timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("transport I/O error: {message}")]
    Io { message: String },

    #[error("transport is closed")]
    Closed,

    #[error("backend responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("call was cancelled")]
    Cancelled,

    /// The backend answered with a JSON-RPC error; passed through unchanged.
    #[error("backend error: {0}")]
    Remote(ErrorObject),
}

impl TransportError {
    pub fn io(error: impl std::fmt::Display) -> Self {
        TransportError::Io {
            message: error.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol { message: message.into() }
    }

    /// Failures worth retrying for idempotent calls.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Io { .. } => true,
            TransportError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True when the backend replied "method not found".
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, TransportError::Remote(error) if error.code == codes::METHOD_NOT_FOUND)
    }
}

/// Bounded retry with doubling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub const HANDSHAKE: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(250),
    };

    /// Only the idempotent handshake is ever retried.
    pub fn for_method(method: &str) -> Option<Self> {
        (method == "initialize").then_some(Self::HANDSHAKE)
    }
}

/// Calls `method`, retrying transient failures when the method allows it.
pub async fn call_with_retry(
    transport: &dyn Transport,
    method: &str,
    params: Option<Value>,
    cancel: &CancellationToken,
) -> Result<Value, TransportError> {
    let Some(policy) = RetryPolicy::for_method(method) else {
        return transport.call(method, params, cancel).await;
    };

    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match transport.call(method, params.clone(), cancel).await {
            Err(error) if error.is_retryable() && attempt < policy.max_attempts && transport.is_open() => {
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {}ms",
                    method,
                    attempt,
                    policy.max_attempts,
                    error,
                    backoff.as_millis()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn call(&self, _method: &str, _params: Option<Value>, _cancel: &CancellationToken) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::io("connection reset"));
            }
            Ok(Value::Bool(true))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }

        fn kind(&self) -> WireTransport {
            WireTransport::Pipe
        }
    }

    fn flaky(failures: u32) -> FlakyTransport {
        FlakyTransport {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn initialize_is_retried_up_to_the_bound() {
        let transport = flaky(2);
        let token = CancellationToken::new();
        let result = call_with_retry(&transport, "initialize", None, &token).await;
        assert!(result.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let transport = flaky(3);
        let result = call_with_retry(&transport, "initialize", None, &token).await;
        assert!(matches!(result, Err(TransportError::Io { .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn calls_with_side_effects_are_never_retried() {
        let transport = flaky(1);
        let token = CancellationToken::new();
        let result = call_with_retry(&transport, "tools/call", None, &token).await;
        assert!(result.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::io("x").is_retryable());
        assert!(
            TransportError::Http {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !TransportError::Http {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!TransportError::Cancelled.is_retryable());
        assert!(TransportError::Remote(ErrorObject::method_not_found("prompts/list")).is_method_not_found());
    }
}
