//! Unified error type for the cortex daemons — maps internal errors to both
//! the RPC status taxonomy and JSON-RPC 2.0 wire codes.

use thiserror::Error;

/// Standard JSON-RPC 2.0 error codes.
const PARSE_ERROR: i32 = -32700;
const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;
/// Application-level server error (implementation-defined).
const SERVER_ERROR: i32 = -32000;

/// The status taxonomy exposed on the wire, independent of JSON-RPC's own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    NotFound,
    FailedPrecondition,
    Unavailable,
    Cancelled,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unavailable => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum CortexError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::sqlite::StorageError),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl CortexError {
    /// Status taxonomy used by the wire protocol and the CLI-facing surface.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ProjectNotFound(_) => StatusCode::NotFound,
            Self::Cancelled => StatusCode::Cancelled,
            Self::Unavailable(_) => StatusCode::Unavailable,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::ParseError(_) | Self::InvalidParams(_) | Self::MethodNotFound(_) => {
                StatusCode::FailedPrecondition
            }
            Self::Storage(_)
            | Self::Git(_)
            | Self::Embedding(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::Internal,
        }
    }

    /// JSON-RPC error code for this error variant.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::ParseError(_) => PARSE_ERROR,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::ProjectNotFound(_)
            | Self::Cancelled
            | Self::Unavailable(_)
            | Self::FailedPrecondition(_)
            | Self::Storage(_)
            | Self::Git(_)
            | Self::Embedding(_)
            | Self::Io(_)
            | Self::Config(_) => SERVER_ERROR,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Convert to (code, message) pair for DaemonResponse::error.
    pub fn into_rpc(self) -> (i32, String) {
        let code = self.rpc_code();
        (code, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CortexError>;
