// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 envelope types shared by every wire surface.
//!
//! A single [`Message`] struct covers requests, notifications, and responses;
//! classification is by field presence, mirroring how the payloads actually
//! look on the wire. Request ids are a tagged value — number, string, or
//! null — with a stable string projection used as the correlation key.

pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const VERSION: &str = "2.0";

// ─── Error codes ─────────────────────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// LSP: request received before the server finished `initialize`.
pub const SERVER_NOT_INITIALIZED: i32 = -32002;
/// LSP: the client cancelled the request via `$/cancelRequest`.
pub const REQUEST_CANCELLED: i32 = -32800;
/// LSP: the document changed while the request was being computed.
pub const CONTENT_MODIFIED: i32 = -32801;

// ─── Request id ──────────────────────────────────────────────────────────────

/// A JSON-RPC request id. The protocol permits numbers, strings, and null;
/// all three occur in the wild (null mostly on error responses to
/// unparseable requests).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    pub fn is_null(&self) -> bool {
        matches!(self, Id::Null)
    }

    /// Stable projection used as the key in pending-response maps. Number
    /// and string ids never collide because the string form of a number id
    /// is all digits while LSP clients use opaque tokens for string ids;
    /// the two sides of one connection additionally mint from disjoint
    /// namespaces.
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => n.to_string(),
            Id::String(s) => s.clone(),
            Id::Null => "<null>".to_string(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

// ─── Error payload ───────────────────────────────────────────────────────────

/// The `error` member of a response.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("jsonrpc error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 message: request, notification, or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    pub fn request(id: Id, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// A success response. `result` is always emitted, as required by the
    /// protocol — pass `Value::Null` for methods whose result is null.
    pub fn response(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Id, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_sets_fields() {
        let msg = Message::request(Id::Number(42), "textDocument/hover", Some(json!({})));
        assert_eq!(msg.jsonrpc, "2.0");
        assert_eq!(msg.method.as_deref(), Some("textDocument/hover"));
        assert!(msg.is_request());
        assert!(!msg.is_notification());
        assert!(!msg.is_response());
    }

    #[test]
    fn notification_has_no_id() {
        let msg = Message::notification("textDocument/didOpen", Some(json!({})));
        assert!(msg.id.is_none());
        assert!(msg.is_notification());
    }

    #[test]
    fn response_classification() {
        let msg = Message::response(Id::Number(1), Value::Null);
        assert!(msg.is_response());
        assert!(!msg.is_request());
    }

    #[test]
    fn null_result_is_serialized() {
        let msg = Message::response(Id::Number(7), Value::Null);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"result\":null"), "got: {json}");
    }

    #[test]
    fn id_roundtrip_number_string_null() {
        for raw in ["1", "\"abc\"", "null"] {
            let id: Id = serde_json::from_str(raw).unwrap();
            let back = serde_json::to_string(&id).unwrap();
            assert_eq!(back, raw);
        }
    }

    #[test]
    fn id_keys_are_stable() {
        assert_eq!(Id::Number(12).key(), "12");
        assert_eq!(Id::String("abc".into()).key(), "abc");
        assert_eq!(Id::Null.key(), "<null>");
    }

    #[test]
    fn error_response_roundtrip() {
        let msg = Message::error_response(
            Id::String("x".into()),
            RpcError::with_data(METHOD_NOT_FOUND, "no handler", json!({"uri": "file:///a"})),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        let err = back.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.data.unwrap()["uri"], "file:///a");
    }

    #[test]
    fn message_roundtrip_json() {
        let msg = Message::request(
            Id::Number(1),
            "initialize",
            Some(json!({ "rootUri": "file:///tmp" })),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method.as_deref(), Some("initialize"));
        assert_eq!(back.params.unwrap()["rootUri"], "file:///tmp");
    }
}
