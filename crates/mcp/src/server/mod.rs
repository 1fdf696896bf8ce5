//! Client-facing transports: line-delimited stdio and HTTP.
//!
//! Both decode envelopes (single or batched), hand requests to the
//! [`GatewayRouter`] with a per-request cancellation token, and encode the
//! responses. Notifications never produce output.

mod http;
mod stdio;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gateway::GatewayRouter;
use crate::protocol::{ErrorObject, Message, RequestId, Response};

pub use http::{
    DEFAULT_BIND_ADDRESS, DEFAULT_MOUNT_PATH, GatewayHttpServer, HttpServerOptions, RunningGatewayHttpServer,
    resolve_bind_address,
};
pub use stdio::serve_stdio;

/// Cancellation tokens of requests currently being answered, keyed by id.
#[derive(Debug, Default)]
pub struct InFlight {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, id: &RequestId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut tokens = self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.insert(id.correlation_key(), token.clone());
        token
    }

    fn complete(&self, id: &RequestId) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.remove(&id.correlation_key());
    }

    /// Cancels the request with `id`; returns whether it was in flight.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match tokens.get(&id.correlation_key()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes one payload and answers it. Returns `None` when nothing should
/// be written back (only notifications or client responses).
pub async fn handle_payload(
    router: &GatewayRouter,
    in_flight: &InFlight,
    payload: &str,
    parent: &CancellationToken,
) -> Option<Value> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(error) => return encode(Response::failure(None, ErrorObject::parse_error(error))),
    };

    match value {
        Value::Array(items) if items.is_empty() => encode(Response::failure(
            None,
            ErrorObject::invalid_request("Empty batch"),
        )),
        Value::Array(items) => {
            let replies = join_all(
                items
                    .into_iter()
                    .map(|item| handle_message(router, in_flight, item, parent)),
            )
            .await;
            let replies: Vec<Value> = replies.into_iter().flatten().collect();
            if replies.is_empty() { None } else { Some(Value::Array(replies)) }
        }
        value => handle_message(router, in_flight, value, parent).await,
    }
}

async fn handle_message(router: &GatewayRouter, in_flight: &InFlight, value: Value, parent: &CancellationToken) -> Option<Value> {
    let message = match Message::parse(value) {
        Ok(message) => message,
        Err(error) => return encode(Response::failure(None, error)),
    };

    match message {
        Message::Request(request) => {
            let id = request.id.clone();
            let token = in_flight.register(&id, parent);
            let response = router.handle_request(request, token).await;
            in_flight.complete(&id);
            encode(response)
        }
        Message::Notification(notification) => {
            if notification.method == "notifications/cancelled"
                && let Some(id) = notification
                    .params
                    .as_ref()
                    .and_then(|params| params.get("requestId"))
                    .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok())
            {
                let cancelled = in_flight.cancel(&id);
                debug!("Client cancelled request {} (in flight: {})", id, cancelled);
            }
            router.handle_notification(notification).await;
            None
        }
        Message::Response(response) => {
            debug!("Ignoring client response for {:?}", response.id);
            None
        }
    }
}

fn encode(response: Response) -> Option<Value> {
    serde_json::to_value(response).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_tokens_follow_their_parent() {
        let in_flight = InFlight::new();
        let parent = CancellationToken::new();
        let first = in_flight.register(&RequestId::Number(1), &parent);
        let second = in_flight.register(&RequestId::from("2"), &parent);
        assert_eq!(in_flight.len(), 2);

        assert!(in_flight.cancel(&RequestId::from("1")));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        in_flight.complete(&RequestId::Number(1));
        assert!(!in_flight.cancel(&RequestId::Number(1)));

        parent.cancel();
        assert!(second.is_cancelled());
    }
}
