//! Shared helpers for leader/worker integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use distrib_protocol::{FailureRecord, TestEvent, TestStatus};
use test_distrib::leader::LeaderService;
use test_distrib::worker::{Execution, InProcessTransport, LeaderClient, TestExecutor, Worker, WorkerOutcome};
use test_distrib::{DistribConfig, SignalState};

/// Configuration with timings short enough for tests
pub fn fast_config() -> DistribConfig {
    DistribConfig {
        watchdog_interval: Duration::from_millis(10),
        test_timeout: Duration::from_secs(30),
        first_test_picked_timeout: Duration::from_secs(30),
        tests_processing_stopped_timeout: Duration::from_secs(30),
        ..DistribConfig::default()
    }
}

pub fn identifiers(tests: &[&str]) -> Vec<String> {
    tests.iter().map(|t| t.to_string()).collect()
}

pub fn passed() -> Execution {
    Execution::new(vec![TestEvent::finished(TestStatus::Passed)])
}

pub fn failed(class: &str, message: &str) -> Execution {
    Execution::new(vec![
        TestEvent::finished(TestStatus::Failed).with_failure(FailureRecord::new(class, message))
    ])
}

/// Run a worker on its own thread against an in-process leader
pub fn spawn_worker<E>(service: Arc<LeaderService>, executor: E, signals: Arc<SignalState>) -> JoinHandle<WorkerOutcome>
where
    E: TestExecutor + Send + 'static,
{
    thread::spawn(move || {
        let client = LeaderClient::new(Box::new(InProcessTransport::new(service)));
        Worker::new(client, executor, signals).run()
    })
}
