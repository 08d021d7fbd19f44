//! Worker consumption loop

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use distrib_protocol::FailureRecord;

use crate::signal::{Signal, SignalState};

use super::client::{ClientError, LeaderClient};
use super::executor::{Execution, TestExecutor};

/// Class name given to panics caught while executing a test
pub const PANIC_CLASS: &str = "WorkerPanic";

/// Class name reported when the very first lease fails
pub const LEASE_FAILED_CLASS: &str = "LeaseFailed";

/// Called with each test and its execution right before the report is sent,
/// e.g. to add worker details to event metadata
pub type BeforeReport = Box<dyn FnMut(&str, &mut Execution) + Send>;

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("worker configuration failed: {}: {}", .0.class_name(), .0.message())]
    Configuration(FailureRecord),

    #[error("{test} failed with {}: {}", .exception.class_name(), .exception.message())]
    TerminalException { test: String, exception: FailureRecord },

    #[error("{test} failed outside of its test cases with {}: {}", .exception.class_name(), .exception.message())]
    NonTestFailure { test: String, exception: FailureRecord },
}

/// How a worker finished
#[derive(Debug)]
pub struct WorkerOutcome {
    pub exit_code: i32,
    /// Tests whose results reached the leader
    pub reported: usize,
    pub error: Option<WorkerError>,
}

/// Leases tests from the leader, runs them and reports the results
pub struct Worker<E> {
    client: LeaderClient,
    executor: E,
    signals: Arc<SignalState>,
    before_report: Option<BeforeReport>,
    reported: usize,
}

impl<E: TestExecutor> Worker<E> {
    pub fn new(client: LeaderClient, executor: E, signals: Arc<SignalState>) -> Self {
        Self {
            client,
            executor,
            signals,
            before_report: None,
            reported: 0,
        }
    }

    /// Run `hook` on every execution before it is reported
    pub fn before_test_report<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&str, &mut Execution) + Send + 'static,
    {
        self.before_report = Some(Box::new(hook));
        self
    }

    /// Configure the executor and consume the queue until the leader stops.
    pub fn run(mut self) -> WorkerOutcome {
        let result = self.configure().and_then(|()| self.consume_queue());

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                if !self.signals.must_abandon() {
                    tracing::error!(worker = self.client.worker_id(), error = %e, "worker failed");
                }
                Some(e)
            }
        };

        let exit_code = match self.signals.exit_code() {
            Some(code) => code,
            None if error.is_some() => 1,
            None => 0,
        };

        tracing::info!(
            worker = self.client.worker_id(),
            reported = self.reported,
            exit_code,
            "worker finished"
        );

        WorkerOutcome {
            exit_code,
            reported: self.reported,
            error,
        }
    }

    fn configure(&mut self) -> Result<(), WorkerError> {
        let profile = match self.client.profile() {
            Ok(profile) => profile,
            Err(ClientError::Disconnected) => return Err(ClientError::Disconnected.into()),
            Err(e) => {
                self.report_configuration_failure(&FailureRecord::new("ProfileUnavailable", e.to_string()));
                return Err(e.into());
            }
        };

        if let Err(exception) = self.executor.prepare(&profile) {
            self.report_configuration_failure(&exception);
            return Err(WorkerError::Configuration(exception));
        }

        tracing::debug!(worker = self.client.worker_id(), seed = profile.seed, "worker configured");
        Ok(())
    }

    fn report_configuration_failure(&mut self, exception: &FailureRecord) {
        if self.signals.force_interrupt() {
            return;
        }
        if let Err(e) = self.client.report_worker_configuration_error(Some(exception)) {
            tracing::warn!(error = %e, "failed to report configuration error");
        }
    }

    fn consume_queue(&mut self) -> Result<(), WorkerError> {
        if self.signals.any() {
            return Ok(());
        }

        let mut leased_any = false;
        loop {
            let test = match self.client.next_test_to_run() {
                Ok(test) => test,
                Err(ClientError::Disconnected) => {
                    tracing::debug!("leader stopped serving tests");
                    return Ok(());
                }
                Err(e) => {
                    // the worker never got going; same as failing to start
                    if !leased_any {
                        self.report_configuration_failure(&FailureRecord::new(LEASE_FAILED_CLASS, e.to_string()));
                    }
                    return Err(e.into());
                }
            };
            leased_any = true;

            let mut execution = self.execute(&test);

            if self.signals.must_abandon() {
                tracing::warn!(test = %test, "abandoning test without reporting");
                return Ok(());
            }

            if let Some(hook) = self.before_report.as_mut() {
                hook(&test, &mut execution);
            }

            let non_test_failure = execution.non_test_failures.first().map(|f| f.exception.clone());
            let stop = |test: String| match non_test_failure.clone() {
                Some(exception) => Err(WorkerError::NonTestFailure { test, exception }),
                None => Ok(()),
            };

            for failure in &execution.non_test_failures {
                tracing::error!(
                    test = %test,
                    class = failure.exception.class_name(),
                    context = %failure.context,
                    "failure outside of test cases"
                );
                match self.client.notify_non_test_failure(&failure.exception, &failure.context) {
                    Ok(()) => {}
                    Err(ClientError::Disconnected) => return stop(test),
                    Err(e) => return Err(e.into()),
                }
            }

            match self
                .client
                .report_test(&test, &execution.events, execution.exception.as_ref())
            {
                Ok(_) => self.reported += 1,
                Err(ClientError::Disconnected) => return stop(test),
                Err(ClientError::Remote(e)) => {
                    self.report_loop_failure(&test, &e.to_string());
                    return Err(ClientError::Remote(e).into());
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(exception) = execution.exception {
                return Err(WorkerError::TerminalException { test, exception });
            }
            if non_test_failure.is_some() {
                return stop(test);
            }

            if self.signals.received(Signal::Interrupt) {
                tracing::info!("interrupted, stopping after the current test");
                return Ok(());
            }
        }
    }

    fn execute(&mut self, test: &str) -> Execution {
        let executor = &mut self.executor;
        match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(test))) {
            Ok(execution) => execution,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Execution::crashed(FailureRecord::new(PANIC_CLASS, message))
            }
        }
    }

    /// Best-effort exception-only report for `test`.
    fn report_loop_failure(&mut self, test: &str, message: &str) {
        if self.signals.must_abandon() {
            return;
        }
        let exception = FailureRecord::new("WorkerError", message);
        if let Err(e) = self.client.report_test(test, &[], Some(&exception)) {
            tracing::debug!(test, error = %e, "failed to report worker error");
        }
    }
}
