//! JSON-RPC error codes and the handler error type.

use crate::envelope::ErrorObject;

// ── Error code constants ────────────────────────────────────────────

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// Method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i64 = -32603;
/// Handler exceeded the request timeout (implementation-defined range).
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Error returned by method handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or of the wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// No handler registered under the method name.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// The requested method.
        method: String,
    },

    /// The handler did not finish in time.
    #[error("Request '{method}' timed out")]
    Timeout {
        /// The requested method.
        method: String,
    },

    /// Unexpected failure inside a handler.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RpcError {
    /// Numeric JSON-RPC code for this variant.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::Timeout { .. } => REQUEST_TIMEOUT,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => "invalid_params",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal",
        }
    }

    /// Convert to the wire-format error member.
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams {
            message: err.to_string(),
        }
    }
}
