//! Request, notification and response envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ErrorObject;

pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of a request. Backends may answer with either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Key used to match a response to its waiter regardless of id form.
    pub fn correlation_key(&self) -> String {
        match self {
            RequestId::Number(number) => number.to_string(),
            RequestId::String(text) => text.clone(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(number) => write!(f, "{number}"),
            RequestId::String(text) => write!(f, "\"{text}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Response envelope. `id` serializes as `null` when the request id could
/// not be determined (parse errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the envelope into its outcome. A missing `result` is `null`.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Any single envelope read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Classifies a decoded JSON value as a request, notification or response.
    pub fn parse(value: Value) -> Result<Self, ErrorObject> {
        let Value::Object(object) = &value else {
            return Err(ErrorObject::invalid_request("Envelope must be a JSON object"));
        };

        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let message = if object.contains_key("method") {
            if has_id {
                serde_json::from_value(value).map(Message::Request)
            } else {
                serde_json::from_value(value).map(Message::Notification)
            }
        } else if object.contains_key("result") || object.contains_key("error") {
            serde_json::from_value(value).map(Message::Response)
        } else {
            return Err(ErrorObject::invalid_request("Envelope has neither method nor result"));
        };

        message.map_err(|error| ErrorObject::invalid_request(format!("Malformed envelope: {error}")))
    }

    /// Id of the envelope, when it has one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Response(response) => response.id.as_ref(),
            Message::Notification(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_requests_and_notifications() {
        let request = Message::parse(json!({"jsonrpc":"2.0","id":7,"method":"tools/list"})).unwrap();
        assert!(matches!(request, Message::Request(Request { id: RequestId::Number(7), .. })));

        let notification = Message::parse(json!({"jsonrpc":"2.0","method":"notifications/initialized"})).unwrap();
        assert!(matches!(notification, Message::Notification(_)));

        let null_id = Message::parse(json!({"jsonrpc":"2.0","id":null,"method":"ping"})).unwrap();
        assert!(matches!(null_id, Message::Notification(_)));
    }

    #[test]
    fn response_with_null_result_is_success() {
        let message = Message::parse(json!({"jsonrpc":"2.0","id":"a","result":null})).unwrap();
        let Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn failure_without_id_serializes_null_id() {
        let response = Response::failure(None, ErrorObject::parse_error("eof"));
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["id"], Value::Null);
        assert_eq!(encoded["error"]["code"], json!(-32700));
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn rejects_non_objects() {
        assert!(Message::parse(json!([1, 2])).is_err());
        assert!(Message::parse(json!({"jsonrpc":"2.0","id":1})).is_err());
    }

    #[test]
    fn correlation_key_ignores_id_form() {
        assert_eq!(RequestId::Number(42).correlation_key(), RequestId::from("42").correlation_key());
    }
}
