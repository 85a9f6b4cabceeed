//! JSON-RPC 2.0 framing.
//!
//! Every MCP message on every transport is one of the shapes below. The
//! untagged [`JsonRpcMessage`] enum mirrors the wire: variant order matters
//! because serde tries them top to bottom.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR_CODE: i64 = -32700;
pub const INVALID_REQUEST_CODE: i64 = -32600;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;
pub const INVALID_PARAMS_CODE: i64 = -32602;
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Request received before the `initialize` handshake completed.
pub const SERVER_NOT_INITIALIZED_CODE: i64 = -32002;
/// Server-initiated request needs a capability the client did not advertise.
pub const CLIENT_NO_CAPABILITY_CODE: i64 = -32003;
/// Application-level tool failure reported as a JSON-RPC error.
pub const TOOL_ERROR_CODE: i64 = -32000;

/// Correlation id for a request. Clients may use strings or integers; both
/// are echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Integer(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JsonRpcErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorDetail {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One item of an inbound batch: requests and notifications may be mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcBatchRequestItem {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// One item of an outbound batch reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcBatchResponseItem {
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

/// Any JSON-RPC payload a peer can put on the wire.
///
/// `Request` must precede `Notification` and `Response` must precede
/// `Notification` in this declaration: untagged deserialization ignores
/// unknown fields, so a request would otherwise also parse as a
/// notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Notification(JsonRpcNotification),
    BatchRequest(Vec<JsonRpcBatchRequestItem>),
    BatchResponse(Vec<JsonRpcBatchResponseItem>),
}

impl JsonRpcMessage {
    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: JsonRpcErrorDetail) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error,
        })
    }

    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_and_notification_disambiguate() {
        let req: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}))
                .expect("request should parse");
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let note: JsonRpcMessage = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .expect("notification should parse");
        assert!(matches!(note, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn batch_round_trip() {
        let raw = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
        ]);
        let msg: JsonRpcMessage = serde_json::from_value(raw.clone()).expect("batch should parse");
        let JsonRpcMessage::BatchRequest(items) = &msg else {
            panic!("expected batch request, got {msg:?}");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(serde_json::to_value(&msg).expect("serialize"), raw);
    }

    #[test]
    fn string_and_integer_ids() {
        let with_str: JsonRpcRequest = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": "abc", "method": "ping"}),
        )
        .expect("string id should parse");
        assert_eq!(with_str.id, RequestId::String("abc".into()));

        let with_int: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
                .expect("integer id should parse");
        assert_eq!(with_int.id, RequestId::Integer(3));
    }
}
