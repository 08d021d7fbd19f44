//! Worker process
//!
//! A worker is stateless: it connects to the leader, applies the run profile
//! and then leases, executes and reports tests one at a time until the
//! leader stops serving.

pub mod client;
pub mod executor;
pub mod runner;

use std::sync::Arc;

use crate::config::DistribConfig;
use crate::signal::SignalState;

pub use client::{ClientError, InProcessTransport, LeaderClient, TcpTransport, Transport, TransportError};
pub use executor::{Execution, FnExecutor, NonTestFailure, TestExecutor};
pub use runner::{BeforeReport, Worker, WorkerError, WorkerOutcome};

/// Connect to `config.leader_addr`, retrying while it is not up yet.
pub fn connect(config: &DistribConfig, signals: &SignalState) -> Result<LeaderClient, TransportError> {
    let transport = TcpTransport::connect_with_retries(
        &config.leader_addr,
        config.leader_connection_attempts,
        config.leader_connection_interval,
        signals,
    )?;
    let client = LeaderClient::new(Box::new(transport));
    tracing::info!(worker = client.worker_id(), leader = %config.leader_addr, "worker connected");
    Ok(client)
}

/// Connect to `config.leader_addr` and run `executor` until the queue is done.
pub fn run<E: TestExecutor>(
    config: &DistribConfig,
    executor: E,
    signals: Arc<SignalState>,
) -> Result<WorkerOutcome, TransportError> {
    let client = connect(config, &signals)?;
    Ok(Worker::new(client, executor, signals).run())
}
