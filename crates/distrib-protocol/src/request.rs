//! RPC request types.

use serde::{Deserialize, Serialize};

use crate::ops::Operation;
use crate::PROTOCOL_VERSION;

/// RPC request envelope.
///
/// Workers send one JSON request per line and wait for the matching response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version spoken by the worker.
    pub protocol_version: i32,
    /// Operation to perform.
    pub op: Operation,
    /// Caller-chosen request ID for correlation.
    pub request_id: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RpcRequest {
    /// Build a request at the current protocol version.
    pub fn new(op: Operation, request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            op,
            request_id: request_id.into(),
            payload,
        }
    }
}
