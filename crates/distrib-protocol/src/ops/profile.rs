//! profile operation types.
//!
//! The profile is an opaque blob configured on the leader and handed to every
//! worker before it starts consuming the queue.

use serde::{Deserialize, Serialize};

/// Profile request payload (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileRequest {}

/// Profile response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileResponse {
    /// Opaque worker configuration.
    pub profile: serde_json::Value,
    /// Seed shared by the whole run.
    pub seed: u64,
}
