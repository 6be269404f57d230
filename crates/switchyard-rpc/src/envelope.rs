//! JSON-RPC wire envelope.
//!
//! A single struct covers requests, notifications and responses. Which one a
//! message is depends on the fields present, see [`Envelope::kind`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

/// Protocol version stamped on envelopes built by this crate.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. The protocol allows either a string or an integer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// Error member of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// The `error` member as it goes on the wire.
    pub fn into_value(self) -> Value {
        let mut value = json!({ "code": self.code, "message": self.message });
        if let Some(data) = self.data {
            value["data"] = data;
        }
        value
    }
}

/// How an envelope is treated when routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and `id`; expects a response.
    Request,
    /// Has `method` but no `id`.
    Notification,
    /// Has `result` or `error`.
    Response,
    /// None of the above.
    Malformed,
}

/// A JSON-RPC message as it travels over the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Correlation id (requests and responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name (requests and notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success payload. `"result": null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error payload, kept as sent. `"error": null` is `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Value>,
}

// A present field always yields `Some`, even when its value is `null`.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    /// Parse a raw JSON payload.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Build a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.into()),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.into()),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.into()),
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Build an error response.
    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.into()),
            id,
            error: Some(error.into_value()),
            ..Self::default()
        }
    }

    /// Classify the envelope for routing.
    pub fn kind(&self) -> MessageKind {
        if self.method.is_some() {
            if self.id.is_some() {
                MessageKind::Request
            } else {
                MessageKind::Notification
            }
        } else if self.result.is_some() || self.error.is_some() {
            MessageKind::Response
        } else {
            MessageKind::Malformed
        }
    }

    /// The `error` member, if it has the standard shape.
    pub fn error_object(&self) -> Option<ErrorObject> {
        self.error
            .as_ref()
            .and_then(|error| ErrorObject::deserialize(error).ok())
    }

    /// Whether this envelope carries a `result` or `error`.
    pub fn is_response(&self) -> bool {
        self.kind() == MessageKind::Response
    }

    /// Serialize to a compact JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
