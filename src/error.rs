//! Error taxonomy for the gateway (spec §7).
//!
//! Per-request errors surface as a JSON-RPC error object on the originating
//! session; per-upstream and per-session errors are logged and contained.
//! Only `ConfigInvalid` and a failure to bind the HTTP listener are fatal.

use axum::http::StatusCode;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("upstream '{0}' unknown")]
    UnknownUpstream(String),

    #[error("tool/prompt/resource '{0}' not found")]
    UnknownTarget(String),

    #[error("'{0}' is ambiguous: {1}")]
    AmbiguousTarget(String, String),

    #[error("too many active sessions")]
    SessionCapExceeded,

    #[error("too many concurrent requests for this session")]
    RequestConcurrencyExceeded,

    #[error("forwarding to upstream failed: {0}")]
    InternalForwardingFailure(String),

    #[error("client protocol error: {0}")]
    ClientProtocolError(String),

    #[error("no such session: {0}")]
    UnknownSession(String),
}

/// JSON-RPC reserved error codes used throughout the gateway (spec §7/§8).
pub mod rpc_code {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
}

impl GatewayError {
    /// The JSON-RPC error code this error kind maps to.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::UnknownUpstream(_)
            | GatewayError::UnknownTarget(_)
            | GatewayError::AmbiguousTarget(..) => rpc_code::METHOD_NOT_FOUND,
            GatewayError::InternalForwardingFailure(_) => rpc_code::INTERNAL_ERROR,
            _ => rpc_code::SERVER_ERROR,
        }
    }

    /// The HTTP status this error kind maps to when it terminates a request
    /// before a JSON-RPC envelope can be produced.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::SessionCapExceeded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RequestConcurrencyExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ClientProtocolError(_) | GatewayError::UnknownSession(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a JSON-RPC 2.0 error envelope with the given request id.
    pub fn to_jsonrpc(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": self.rpc_code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Build the envelope used for the two boundary scenarios that have no
/// originating request id (over-cap rejections): `id` is JSON `null`.
pub fn capacity_envelope(message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": rpc_code::SERVER_ERROR, "message": message },
        "id": Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_maps_to_method_not_found() {
        let e = GatewayError::UnknownTarget("foo".into());
        assert_eq!(e.rpc_code(), rpc_code::METHOD_NOT_FOUND);
    }

    #[test]
    fn session_cap_maps_to_503() {
        let e = GatewayError::SessionCapExceeded;
        assert_eq!(e.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn concurrency_maps_to_429() {
        let e = GatewayError::RequestConcurrencyExceeded;
        assert_eq!(e.http_status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn envelope_shape() {
        let v = capacity_envelope("too many active sessions");
        assert_eq!(v["error"]["code"], -32000);
        assert!(v["id"].is_null());
    }
}
