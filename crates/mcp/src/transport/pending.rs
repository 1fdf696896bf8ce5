//! Correlation of responses to outstanding calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::protocol::{RequestId, Response};
use crate::transport::TransportError;

type Waiter = oneshot::Sender<Result<Response, TransportError>>;

#[derive(Default)]
struct PendingState {
    waiters: HashMap<String, Waiter>,
    closed: bool,
}

/// Outstanding calls keyed by correlation id.
///
/// Responses may arrive in any order; each resolves the waiter registered
/// under its id. Once closed, every waiter is resolved with an error and new
/// registrations are refused.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
    next_id: AtomicI64,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::default(),
            next_id: AtomicI64::new(1),
        })
    }

    /// Allocates a fresh numeric request id.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a waiter for `id`.
    pub fn register(self: &Arc<Self>, id: &RequestId) -> Result<PendingCall, TransportError> {
        let key = id.correlation_key();
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.waiters.insert(key.clone(), sender);
        Ok(PendingCall {
            key,
            receiver: Some(receiver),
            owner: Arc::clone(self),
        })
    }

    /// Delivers a response to its waiter. Returns false when nobody waits for it.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(key) = response.id.as_ref().map(RequestId::correlation_key) else {
            return false;
        };
        let waiter = self.lock().waiters.remove(&key);
        match waiter {
            Some(sender) => sender.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Resolves a single waiter with an error.
    pub fn fail(&self, id: &RequestId, error: TransportError) -> bool {
        let waiter = self.lock().waiters.remove(&id.correlation_key());
        waiter.is_some_and(|sender| sender.send(Err(error)).is_ok())
    }

    /// Resolves every waiter with `make_error()` and refuses new ones.
    pub fn close_all(&self, make_error: impl Fn() -> TransportError) {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiters.drain().map(|(_, sender)| sender).collect()
        };
        for sender in waiters {
            let _ = sender.send(Err(make_error()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    fn forget(&self, key: &str) {
        self.lock().waiters.remove(key);
    }
}

/// A registered waiter. Dropping it unregisters the id.
pub struct PendingCall {
    key: String,
    receiver: Option<oneshot::Receiver<Result<Response, TransportError>>>,
    owner: Arc<PendingCalls>,
}

impl PendingCall {
    /// Waits for the response, the timeout, or cancellation, whichever is first.
    pub async fn wait(mut self, method: &str, timeout: Duration, cancel: &CancellationToken) -> Result<Response, TransportError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(TransportError::Closed),
            },
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.owner.forget(&self.key);
    }
}
