//! test-distrib - distributed test runner
//!
//! A leader process holds the queue of test identifiers for one run and hands
//! them out to worker processes over a line-delimited JSON RPC. Workers run
//! each test and report the results back. The leader retries failures per
//! policy, reclaims leases that time out and decides the final verdict.

pub mod config;
pub mod integration;
pub mod leader;
pub mod logging;
pub mod signal;
pub mod worker;

pub use config::{ConfigError, DistribConfig};
pub use leader::{Leader, LeaderError, LeaderOutcome};
pub use signal::{SignalState, EXIT_CODE_INTERRUPT, EXIT_CODE_TERMINATE};
pub use worker::{Worker, WorkerOutcome};
