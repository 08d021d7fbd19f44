//! Leader RPC service
//!
//! Owns the run state shared by every worker connection. [`LeaderService::handle`]
//! is the only entry point used by transports; it never fails and never
//! panics; problems become error responses and, where they mean the run
//! cannot be trusted, an abort.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use distrib_protocol::ops::{
    ConfigurationErrorRequest, NextTestRequest, NextTestResponse, NonTestFailureRequest, ProfileRequest,
    ProfileResponse, ReportTestRequest, ReportTestResponse,
};
use distrib_protocol::{
    FailureRecord, Operation, RpcError, RpcRequest, RpcResponse, TestEvent, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ConfigError, DistribConfig};

use super::handle::{FailureCause, ServiceHandle};
use super::metrics::RunMetrics;
use super::policy::ErrorPolicy;
use super::queue::{LeaseQueue, QueueError};
use super::reporter::{Reporter, RunSummary};

/// Failures inside an operation handler
#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error("invalid payload: {0}")]
    Malformed(serde_json::Error),

    #[error("failed to encode response: {0}")]
    Encode(serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("service stopped")]
    Stopped,

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Reporter and policy share one lock so a report is decided and recorded
/// atomically.
struct Reporting {
    reporter: Box<dyn Reporter>,
    policy: Box<dyn ErrorPolicy>,
    /// Last progress decile logged
    progress: usize,
}

pub struct LeaderService {
    queue: Arc<LeaseQueue>,
    handle: ServiceHandle,
    metrics: Arc<RunMetrics>,
    reporting: Mutex<Reporting>,
    run_started: Once,
    benign_patterns: Vec<Regex>,
    profile: Value,
    seed: u64,
}

impl LeaderService {
    pub fn new(
        config: &DistribConfig,
        queue: Arc<LeaseQueue>,
        handle: ServiceHandle,
        metrics: Arc<RunMetrics>,
        reporter: Box<dyn Reporter>,
        policy: Box<dyn ErrorPolicy>,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            queue,
            handle,
            metrics,
            reporting: Mutex::new(Reporting {
                reporter,
                policy,
                progress: 0,
            }),
            run_started: Once::new(),
            benign_patterns: config.benign_patterns()?,
            profile: config.profile.clone(),
            seed,
        })
    }

    /// Handle a decoded JSON document as a request.
    pub fn handle_value(&self, value: Value) -> RpcResponse {
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.handle(request),
            Err(e) => self.reject_malformed(request_id, e),
        }
    }

    /// Answer a request that could not be decoded and abort the run.
    pub fn reject_malformed(&self, request_id: String, error: impl fmt::Display) -> RpcResponse {
        tracing::error!(request_id = %request_id, error = %error, "malformed request");
        self.handle.abort(FailureCause::MalformedRequest);
        RpcResponse::failed(request_id, RpcError::invalid_request(format!("malformed request: {}", error)))
    }

    /// Handle one request.
    pub fn handle(&self, request: RpcRequest) -> RpcResponse {
        let request_id = request.request_id.clone();
        let op = request.op;

        if request.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                op = %op,
                requested = request.protocol_version,
                "unsupported protocol version"
            );
            return RpcResponse::failed(
                request_id,
                RpcError::unsupported_protocol(request.protocol_version, PROTOCOL_VERSION),
            );
        }

        if self.handle.is_stopped() {
            return RpcResponse::stopped(request_id);
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request)))
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(payload) => RpcResponse::answer(request_id, payload),
            Err(HandlerError::Stopped) => RpcResponse::stopped(request_id),
            Err(HandlerError::Malformed(e)) => self.reject_malformed(request_id, e),
            Err(e) => {
                tracing::error!(op = %op, request_id = %request_id, error = %e, "request failed");
                self.handle.abort(FailureCause::InternalError);
                RpcResponse::failed(request_id, RpcError::internal(e.to_string()))
            }
        }
    }

    fn dispatch(&self, request: RpcRequest) -> Result<Value, HandlerError> {
        match request.op {
            Operation::NextTestToRun => {
                let payload: NextTestRequest = decode(request.payload)?;
                let test = self
                    .next_test_to_run(payload.worker_id.as_deref())?
                    .ok_or(HandlerError::Stopped)?;
                encode(&NextTestResponse { test })
            }
            Operation::ReportTest => {
                let payload: ReportTestRequest = decode(request.payload)?;
                let response = self.report_test(&payload.test, &payload.events, payload.exception.as_ref())?;
                encode(&response)
            }
            Operation::ReportWorkerConfigurationError => {
                let payload: ConfigurationErrorRequest = decode(request.payload)?;
                self.report_worker_configuration_error(payload.exception.as_ref(), payload.worker_id.as_deref());
                Ok(Value::Null)
            }
            Operation::NotifyNonTestFailure => {
                let payload: NonTestFailureRequest = decode(request.payload)?;
                self.notify_non_test_failure(&payload.exception, &payload.context, payload.worker_id.as_deref());
                Ok(Value::Null)
            }
            Operation::Profile => {
                let _: ProfileRequest = decode(request.payload)?;
                encode(&self.profile())
            }
        }
    }

    /// Lease a test for a worker, waiting while none is queued.
    ///
    /// `None` once the service stops.
    pub fn next_test_to_run(&self, worker_id: Option<&str>) -> Result<Option<String>, QueueError> {
        self.run_started.call_once(|| {
            self.reporting.lock().reporter.run_started(self.queue.total());
        });
        self.metrics.test_taken();

        let test = self.queue.lease()?;
        if let Some(test) = &test {
            tracing::debug!(test = %test, worker = worker_id.unwrap_or("-"), "leased");
        }
        Ok(test)
    }

    /// Account for a finished test.
    ///
    /// Returns `None` when the test was already completed and the report is
    /// dropped.
    pub fn report_test(
        &self,
        test: &str,
        events: &[TestEvent],
        exception: Option<&FailureRecord>,
    ) -> Result<Option<ReportTestResponse>, QueueError> {
        let mut reporting = self.reporting.lock();

        if self.queue.is_completed(test)? {
            tracing::debug!(test = %test, "test already completed, dropping report");
            return Ok(None);
        }

        if reporting.policy.retry_test(test, events, exception) {
            self.queue.repush(test)?;
            reporting.reporter.report_retrying(test, events);
            self.metrics.test_retried();
            tracing::info!(test = %test, "test failed, will be retried");
            return Ok(Some(ReportTestResponse {
                will_be_retried: true,
                events: events.len(),
            }));
        }

        reporting.reporter.report_test(test, events);
        self.queue.release(test)?;

        if let Some(exception) = exception {
            if self.is_benign(exception) {
                tracing::warn!(
                    test = %test,
                    class = exception.class_name(),
                    message = exception.message(),
                    "ignoring worker exception"
                );
            } else {
                tracing::error!(
                    test = %test,
                    class = exception.class_name(),
                    message = exception.message(),
                    "worker failed while running test, aborting run"
                );
                self.handle.abort(FailureCause::FailedWorker);
            }
        }

        self.log_progress(&mut reporting)?;

        Ok(Some(ReportTestResponse {
            will_be_retried: false,
            events: events.len(),
        }))
    }

    /// Record a worker that failed to start. Aborts unless the policy
    /// tolerates it.
    pub fn report_worker_configuration_error(&self, exception: Option<&FailureRecord>, worker_id: Option<&str>) {
        let ignored = self.reporting.lock().policy.ignore_worker_failure(exception);
        let worker = worker_id.unwrap_or("-");
        let class = exception.map(|e| e.class_name()).unwrap_or("unknown");
        let message = exception.map(|e| e.message()).unwrap_or("");

        if ignored {
            tracing::warn!(worker, class, message, "worker failed to start, continuing");
        } else {
            tracing::error!(worker, class, message, "worker failed to start, aborting run");
            self.handle.abort(FailureCause::ConfigurationError);
        }
    }

    /// Record a failure raised outside any test. Unless the policy tolerates
    /// it, the reporter sees it and the run stops.
    pub fn notify_non_test_failure(&self, exception: &FailureRecord, context: &str, worker_id: Option<&str>) {
        let worker = worker_id.unwrap_or("-");
        let class = exception.class_name();
        tracing::info!(worker, class, "worker failed outside of tests");

        let mut reporting = self.reporting.lock();
        if reporting.policy.ignore_worker_failure(Some(exception)) {
            tracing::warn!(worker, class, message = exception.message(), "ignoring failure outside of tests");
            return;
        }

        tracing::error!(
            worker,
            class,
            message = exception.message(),
            context,
            "worker failed outside of tests, aborting run"
        );
        reporting.reporter.report_non_test_failure(exception, context);
        drop(reporting);
        self.handle.abort(FailureCause::NonTestFailure);
    }

    /// Opaque worker profile and run seed
    pub fn profile(&self) -> ProfileResponse {
        ProfileResponse {
            profile: self.profile.clone(),
            seed: self.seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether the reporter saw failed tests
    pub fn reporter_has_failures(&self) -> bool {
        self.reporting.lock().reporter.has_failures()
    }

    pub fn run_finished(&self, summary: &RunSummary) {
        self.reporting.lock().reporter.run_finished(summary);
    }

    fn is_benign(&self, exception: &FailureRecord) -> bool {
        self.benign_patterns
            .iter()
            .any(|pattern| pattern.is_match(exception.message()))
    }

    fn log_progress(&self, reporting: &mut Reporting) -> Result<(), QueueError> {
        let total = self.queue.total();
        if total == 0 {
            return Ok(());
        }

        let completed = self.queue.completed_size()?;
        let decile = completed * 10 / total;
        if decile > reporting.progress {
            reporting.progress = decile;
            tracing::info!("Completed {}% ({}/{})", decile * 10, completed, total);
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    let payload = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(HandlerError::Malformed)
}

fn encode<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value).map_err(HandlerError::Encode)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
