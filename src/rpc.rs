//! JSON-RPC 2.0 envelopes spoken with the client
//!
//! One JSON object per WebSocket message. Binary payloads travel as a
//! `message`/`encoding` pair.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::transport::TransportError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Errors returned to the client in an `error` envelope. The display text
/// is the message the client sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid device ID")]
    InvalidPeripheral,

    #[error("Unsupported encoding: {0}")]
    Encoding(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Unavailable(String),
}

impl RpcError {
    /// The `error` member of a response.
    pub fn to_object(&self) -> Value {
        json!({ "message": self.to_string() })
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => RpcError::NotConnected,
            other => RpcError::Transport(other.to_string()),
        }
    }
}

/// Why an incoming message was not a usable request.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported jsonrpc version {0:?}")]
    Version(String),
}

/// Every method a session can be asked to run. Each family supports a
/// subset; the rest answer with [`RpcError::UnknownMethod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Discover,
    Connect,
    Read,
    Write,
    StartNotifications,
    StopNotifications,
    Send,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Discover => "discover",
            Method::Connect => "connect",
            Method::Read => "read",
            Method::Write => "write",
            Method::StartNotifications => "startNotifications",
            Method::StopNotifications => "stopNotifications",
            Method::Send => "send",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discover" => Ok(Method::Discover),
            "connect" => Ok(Method::Connect),
            "read" => Ok(Method::Read),
            "write" => Ok(Method::Write),
            "startNotifications" => Ok(Method::StartNotifications),
            "stopNotifications" => Ok(Method::StopNotifications),
            "send" => Ok(Method::Send),
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

/// A request, or a client notification when `id` is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// `Some(Value::Null)` for an explicit `"id": null`.
    #[serde(default, deserialize_with = "present")]
    pub id: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Request {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let request: Request = serde_json::from_str(text)?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(EnvelopeError::Version(request.jsonrpc));
        }
        Ok(request)
    }
}

/// Server-to-client message without an `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// The fatal-error notification sent before a session gives up.
    pub fn error(message: impl fmt::Display) -> Self {
        Self::new("error", json!({ "message": message.to_string() }))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method,
            "params": self.params,
        })
    }
}

/// The response envelope for request `id`.
pub fn response(id: Value, outcome: Result<Value, RpcError>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error.to_object() }),
    }
}

/// Look up `key` in `params`; a missing params object has no keys.
pub fn param<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    params.get(key).filter(|v| !v.is_null())
}

pub fn required<'a>(params: &'a Value, key: &str) -> Result<&'a Value, RpcError> {
    param(params, key).ok_or_else(|| RpcError::InvalidParams(format!("missing {}", key)))
}

pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    required(params, key)?
        .as_str()
        .ok_or_else(|| RpcError::InvalidParams(format!("{} must be a string", key)))
}

pub fn flag(params: &Value, key: &str) -> bool {
    param(params, key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, RpcError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| RpcError::InvalidParams(format!("bad base64 message: {}", e)))
}

/// Decode the `message` parameter according to `encoding` (base64 when
/// absent, or utf8).
pub fn decode_message(params: &Value) -> Result<Vec<u8>, RpcError> {
    let message = required_str(params, "message")?;
    match param(params, "encoding").and_then(Value::as_str).unwrap_or("base64") {
        "base64" => decode_base64(message),
        "utf8" => Ok(message.as_bytes().to_vec()),
        other => Err(RpcError::Encoding(other.to_string())),
    }
}

/// The `message`/`encoding` pair for outgoing binary data.
pub fn encoded_message(data: &[u8]) -> Value {
    json!({ "message": encode_base64(data), "encoding": "base64" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        for method in [
            Method::Discover,
            Method::Connect,
            Method::Read,
            Method::Write,
            Method::StartNotifications,
            Method::StopNotifications,
            Method::Send,
        ] {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert_eq!(
            "getServices".parse::<Method>(),
            Err(RpcError::UnknownMethod("getServices".into()))
        );
    }

    #[test]
    fn test_parse_request() {
        let req =
            Request::parse(r#"{"jsonrpc":"2.0","method":"discover","params":{},"id":7}"#).unwrap();
        assert_eq!(req.method, "discover");
        assert_eq!(req.id, Some(json!(7)));

        let note = Request::parse(r#"{"jsonrpc":"2.0","method":"send"}"#).unwrap();
        assert_eq!(note.id, None);
        assert!(note.params.is_null());

        let null_id = Request::parse(r#"{"jsonrpc":"2.0","method":"send","id":null}"#).unwrap();
        assert_eq!(null_id.id, Some(Value::Null));

        assert!(matches!(
            Request::parse(r#"{"jsonrpc":"1.0","method":"discover","id":1}"#),
            Err(EnvelopeError::Version(_))
        ));
        assert!(matches!(Request::parse("{not json"), Err(EnvelopeError::Json(_))));
    }

    #[test]
    fn test_response_preserves_id() {
        let ok = response(json!("abc"), Ok(json!(null)));
        assert_eq!(ok, json!({"jsonrpc":"2.0","id":"abc","result":null}));

        let err = response(json!(4), Err(RpcError::NotConnected));
        assert_eq!(err, json!({"jsonrpc":"2.0","id":4,"error":{"message":"Not connected"}}));
    }

    #[test]
    fn test_decode_message_encodings() {
        assert_eq!(
            decode_message(&json!({"message":"AQID","encoding":"base64"})).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(decode_message(&json!({"message":"AQID"})).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            decode_message(&json!({"message":"hi","encoding":"utf8"})).unwrap(),
            b"hi".to_vec()
        );
        assert_eq!(
            decode_message(&json!({"message":"hi","encoding":"hex"})),
            Err(RpcError::Encoding("hex".into()))
        );
        assert!(matches!(decode_message(&json!({})), Err(RpcError::InvalidParams(_))));
        assert!(matches!(
            decode_message(&json!({"message":"!!"})),
            Err(RpcError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_notification_envelope() {
        let note =
            Notification::new("didReceiveMessage", encoded_message(&[0x02, 0x00, 0x00, 0x0B]));
        assert_eq!(
            note.to_json(),
            json!({
                "jsonrpc": "2.0",
                "method": "didReceiveMessage",
                "params": {"message": "AgAACw==", "encoding": "base64"}
            })
        );
    }

    #[test]
    fn test_transport_errors_map() {
        assert_eq!(RpcError::from(TransportError::NotConnected), RpcError::NotConnected);
        let err = RpcError::from(TransportError::WriteFailed {
            attempts: 3,
            last: "timed out".into(),
        });
        assert_eq!(err.to_string(), "Write failed after 3 attempts: timed out");
    }
}
