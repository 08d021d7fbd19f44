//! test-distrib Protocol Types
//!
//! Defines the JSON RPC envelope for leader↔worker communication, the closed
//! set of operations the leader exposes, and the transportable records
//! (test events, failure chains) that cross the wire.

pub mod error;
pub mod framing;
pub mod ops;
pub mod record;
pub mod request;
pub mod response;

pub use error::{ErrorCode, RpcError};
pub use framing::{read_message, read_message_with_limit, write_message, FrameError, MAX_MESSAGE_SIZE};
pub use ops::Operation;
pub use record::{ExceptionInfo, FailureRecord, TestEvent, TestStatus};
pub use request::RpcRequest;
pub use response::RpcResponse;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 1;
