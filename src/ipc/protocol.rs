//! Shared JSON-RPC 2.0 protocol types for daemon IPC (newline-delimited
//! JSON-RPC 2.0 over the Unix stream, one object or batch array per line).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming JSON-RPC request from a client.
#[derive(Debug, Deserialize)]
pub struct DaemonRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl DaemonRequest {
    /// Extract `path` from params (the project path carried by most RPCs).
    pub fn project_path(&self) -> Option<&str> {
        self.params.get("path").and_then(|v| v.as_str())
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct DaemonResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    /// The status taxonomy word ("not_found", "unavailable", ...).
    pub status: &'static str,
}

impl DaemonResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: String, status: &'static str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message,
                status,
            }),
        }
    }

    /// Build an error response from a [`crate::error::CortexError`].
    pub fn from_cortex_error(id: Value, err: crate::error::CortexError) -> Self {
        let status = err.status().as_str();
        let (code, message) = err.into_rpc();
        Self::error(id, code, message, status)
    }
}

/// Server-to-client JSON-RPC notification (no `id` field). Used for
/// `StreamLogs` fan-out.
#[derive(Debug, Serialize, Clone)]
pub struct DaemonNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl DaemonNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}
