//! Worker side of the leader RPC
//!
//! [`Transport`] moves one request/response pair; [`LeaderClient`] wraps it
//! with typed operations and folds every way the leader can go away into
//! [`ClientError::Disconnected`].

use std::io::{self, BufReader};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use distrib_protocol::ops::{
    ConfigurationErrorRequest, NextTestRequest, NextTestResponse, NonTestFailureRequest, ProfileRequest,
    ProfileResponse, ReportTestRequest, ReportTestResponse,
};
use distrib_protocol::{
    read_message, write_message, ErrorCode, FailureRecord, FrameError, Operation, RpcError, RpcRequest,
    RpcResponse, TestEvent,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::leader::LeaderService;
use crate::signal::SignalState;

/// Moves one request to the leader and returns its response
pub trait Transport: Send {
    fn execute(&mut self, request: &RpcRequest) -> Result<RpcResponse, TransportError>;
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("connection closed by leader")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the leader is gone rather than misbehaving
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Frame(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

/// Newline-delimited JSON over TCP
pub struct TcpTransport {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            writer: stream.try_clone()?,
            reader: BufReader::new(stream),
        })
    }

    /// Connect, retrying while the leader is not listening yet.
    ///
    /// Gives up early once a signal was received.
    pub fn connect_with_retries(
        addr: &str,
        attempts: u32,
        interval: Duration,
        signals: &SignalState,
    ) -> Result<Self, TransportError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(addr) {
                Ok(transport) => {
                    tracing::debug!(addr, attempt, "connected to leader");
                    return Ok(transport);
                }
                Err(source) if attempt >= attempts || signals.any() => {
                    return Err(TransportError::Connect {
                        addr: addr.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::debug!(addr, attempt, error = %e, "leader not reachable yet");
                    thread::sleep(interval);
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn execute(&mut self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        write_message(&mut self.writer, request)?;
        read_message(&mut self.reader)?.ok_or(TransportError::Closed)
    }
}

/// Calls a [`LeaderService`] in the same process.
///
/// Requests and responses still go through JSON so both ends see exactly
/// what they would over TCP.
pub struct InProcessTransport {
    service: Arc<LeaderService>,
}

impl InProcessTransport {
    pub fn new(service: Arc<LeaderService>) -> Self {
        Self { service }
    }
}

impl Transport for InProcessTransport {
    fn execute(&mut self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let response = self.service.handle_value(serde_json::to_value(request)?);
        let wire = serde_json::to_string(&response)?;
        Ok(serde_json::from_str(&wire)?)
    }
}

/// Leader client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The leader closed the connection or stopped serving
    #[error("disconnected from leader")]
    Disconnected,

    #[error("leader error: {0}")]
    Remote(RpcError),

    #[error(transparent)]
    Transport(TransportError),

    #[error("unexpected response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        if e.is_disconnect() {
            ClientError::Disconnected
        } else {
            ClientError::Transport(e)
        }
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        if e.code == ErrorCode::ServiceStopped {
            ClientError::Disconnected
        } else {
            ClientError::Remote(e)
        }
    }
}

/// Typed leader operations for one worker
pub struct LeaderClient {
    transport: Box<dyn Transport>,
    worker_id: String,
    next_request: u64,
}

impl LeaderClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_worker_id(transport, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_worker_id(transport: Box<dyn Transport>, worker_id: impl Into<String>) -> Self {
        Self {
            transport,
            worker_id: worker_id.into(),
            next_request: 0,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn call<P: Serialize, R: DeserializeOwned>(&mut self, op: Operation, payload: &P) -> Result<R, ClientError> {
        self.next_request += 1;
        let request_id = format!("{}-{}", self.worker_id, self.next_request);
        let request = RpcRequest::new(op, request_id, serde_json::to_value(payload)?);

        let response = self.transport.execute(&request)?;
        let payload = response.into_result()?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Lease the next test, waiting while none is queued
    pub fn next_test_to_run(&mut self) -> Result<String, ClientError> {
        let payload = NextTestRequest {
            worker_id: Some(self.worker_id.clone()),
        };
        let response: NextTestResponse = self.call(Operation::NextTestToRun, &payload)?;
        Ok(response.test)
    }

    /// Report a test's events. `None` when the leader dropped the report.
    pub fn report_test(
        &mut self,
        test: &str,
        events: &[TestEvent],
        exception: Option<&FailureRecord>,
    ) -> Result<Option<ReportTestResponse>, ClientError> {
        let payload = ReportTestRequest {
            test: test.to_string(),
            events: events.to_vec(),
            exception: exception.cloned(),
            worker_id: Some(self.worker_id.clone()),
        };
        self.call(Operation::ReportTest, &payload)
    }

    pub fn report_worker_configuration_error(&mut self, exception: Option<&FailureRecord>) -> Result<(), ClientError> {
        let payload = ConfigurationErrorRequest {
            exception: exception.cloned(),
            worker_id: Some(self.worker_id.clone()),
        };
        let _: serde_json::Value = self.call(Operation::ReportWorkerConfigurationError, &payload)?;
        Ok(())
    }

    /// Tell the leader about a failure raised outside any test
    pub fn notify_non_test_failure(&mut self, exception: &FailureRecord, context: &str) -> Result<(), ClientError> {
        let payload = NonTestFailureRequest {
            exception: exception.clone(),
            context: context.to_string(),
            worker_id: Some(self.worker_id.clone()),
        };
        let _: serde_json::Value = self.call(Operation::NotifyNonTestFailure, &payload)?;
        Ok(())
    }

    pub fn profile(&mut self) -> Result<ProfileResponse, ClientError> {
        self.call(Operation::Profile, &ProfileRequest {})
    }
}
