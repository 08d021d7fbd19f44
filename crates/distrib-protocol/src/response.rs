//! Leader replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, RpcError};
use crate::PROTOCOL_VERSION;

/// One line sent back by the leader for every request line it reads.
///
/// `ok` decides which of `payload` and `error` is present. A successful reply
/// may carry a `null` payload, which is how a dropped duplicate report is
/// answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always the leader's own version, even when rejecting a mismatch
    pub protocol_version: i32,
    /// `request_id` of the request, or empty when it could not be read
    pub request_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn answer(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: RpcError) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Reply sent for every request once the run is over
    pub fn stopped(request_id: impl Into<String>) -> Self {
        Self::failed(request_id, RpcError::service_stopped())
    }

    /// Whether the leader has stopped serving tests
    pub fn is_stopped(&self) -> bool {
        self.error.as_ref().map(|e| e.code) == Some(ErrorCode::ServiceStopped)
    }

    /// The payload of a successful reply, `null` when absent.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.payload.unwrap_or(Value::Null)),
            (false, Some(error)) => Err(error),
            (false, None) => Err(RpcError::internal("error response without error details")),
        }
    }
}
