//! Error taxonomy for the session engine and registry, with the JSON-RPC
//! code each kind maps to on the wire.

use crate::coerce::CoercionError;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use toolbus_protocol::CLIENT_NO_CAPABILITY_CODE;
use toolbus_protocol::INTERNAL_ERROR_CODE;
use toolbus_protocol::INVALID_PARAMS_CODE;
use toolbus_protocol::INVALID_REQUEST_CODE;
use toolbus_protocol::JsonRpcErrorDetail;
use toolbus_protocol::METHOD_NOT_FOUND_CODE;
use toolbus_protocol::PARSE_ERROR_CODE;
use toolbus_protocol::SERVER_NOT_INITIALIZED_CODE;
use toolbus_protocol::TOOL_ERROR_CODE;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("parse error")]
    Parse,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {message}")]
    InvalidParams {
        message: String,
        data: Option<Value>,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server not initialized")]
    NotInitialized,

    #[error("client does not support roots/list")]
    ClientHasNoRootsSupport,

    #[error("client does not support sampling")]
    ClientHasNoSamplingSupport,

    #[error("client does not support elicitation")]
    ClientHasNoElicitationSupport,

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("no resource matches uri: {0}")]
    UnknownResource(String),

    /// A tool reported a failure the session chose to surface as a JSON-RPC
    /// error rather than an `isError` result.
    #[error("tool failed: {0}")]
    ToolFailure(String),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    /// The peer answered one of our outbound requests with an error object.
    #[error("client returned error {code}: {message}")]
    ClientResponse { code: i64, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("request timed out")]
    Timeout,
}

impl ServerError {
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ServerError::Parse => PARSE_ERROR_CODE,
            ServerError::InvalidRequest(_) => INVALID_REQUEST_CODE,
            ServerError::MethodNotFound(_) => METHOD_NOT_FOUND_CODE,
            ServerError::InvalidParams { .. }
            | ServerError::Coercion(_)
            | ServerError::UnknownTool(_)
            | ServerError::UnknownPrompt(_)
            | ServerError::UnknownResource(_) => INVALID_PARAMS_CODE,
            ServerError::NotInitialized => SERVER_NOT_INITIALIZED_CODE,
            ServerError::ClientHasNoRootsSupport
            | ServerError::ClientHasNoSamplingSupport
            | ServerError::ClientHasNoElicitationSupport => CLIENT_NO_CAPABILITY_CODE,
            ServerError::ToolFailure(_) => TOOL_ERROR_CODE,
            ServerError::Internal(_)
            | ServerError::ClientResponse { .. }
            | ServerError::SessionClosed
            | ServerError::Timeout => INTERNAL_ERROR_CODE,
        }
    }

    /// Wire representation; coercion failures carry the parameter detail in
    /// `data` so clients can point at the offending argument.
    pub fn to_error_detail(&self) -> JsonRpcErrorDetail {
        let data = match self {
            ServerError::InvalidParams { data, .. } => data.clone(),
            ServerError::Coercion(CoercionError::MissingRequiredParameter { name }) => {
                Some(json!({ "parameter": name }))
            }
            ServerError::Coercion(CoercionError::InvalidArgumentType {
                name,
                expected,
                actual,
            }) => Some(json!({ "parameter": name, "expected": expected, "actual": actual })),
            ServerError::UnknownTool(name) => Some(json!({ "tool": name })),
            ServerError::UnknownPrompt(name) => Some(json!({ "prompt": name })),
            ServerError::UnknownResource(uri) => Some(json!({ "uri": uri })),
            _ => None,
        };
        JsonRpcErrorDetail {
            code: self.json_rpc_code(),
            message: self.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(ServerError::Parse.json_rpc_code(), -32700);
        assert_eq!(ServerError::MethodNotFound("x".into()).json_rpc_code(), -32601);
        assert_eq!(ServerError::NotInitialized.json_rpc_code(), -32002);
        assert_eq!(ServerError::ClientHasNoSamplingSupport.json_rpc_code(), -32003);
        assert_eq!(ServerError::ToolFailure("x".into()).json_rpc_code(), -32000);
        assert_eq!(
            ServerError::Coercion(CoercionError::MissingRequiredParameter { name: "b".into() })
                .json_rpc_code(),
            -32602
        );
    }

    #[test]
    fn missing_parameter_detail_names_the_parameter() {
        let err = ServerError::Coercion(CoercionError::MissingRequiredParameter {
            name: "b".into(),
        });
        let detail = err.to_error_detail();
        assert!(detail.message.contains("\"b\""));
        assert_eq!(detail.data, Some(json!({ "parameter": "b" })));
    }
}
