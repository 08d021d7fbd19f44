//! Stop handle shared by the RPC service, the server and the watchdog

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::queue::LeaseQueue;

/// Subsystem responsible for a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Liveness timeout fired
    Watchdog,
    /// A worker reported a terminal exception
    FailedWorker,
    /// A worker could not be configured
    ConfigurationError,
    /// A worker failed outside any test
    NonTestFailure,
    /// A request payload could not be decoded
    MalformedRequest,
    /// A handler failed or panicked
    InternalError,
    Signal,
    /// The reporter recorded test failures
    Reporter,
    /// Completed plus outstanding tests do not add up
    CountMismatch,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Watchdog => "watchdog",
            FailureCause::FailedWorker => "failed_worker",
            FailureCause::ConfigurationError => "configuration_error",
            FailureCause::NonTestFailure => "non_test_failure",
            FailureCause::MalformedRequest => "malformed_request",
            FailureCause::InternalError => "internal_error",
            FailureCause::Signal => "signal",
            FailureCause::Reporter => "reporter",
            FailureCause::CountMismatch => "count_mismatch",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the RPC service stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every test completed
    Drained,
    Signal,
    /// Liveness timeout
    Watchdog,
    Aborted(FailureCause),
}

#[derive(Debug, Default)]
struct StopState {
    reason: Option<StopReason>,
    aborts: Vec<FailureCause>,
}

#[derive(Debug)]
struct Inner {
    queue: Arc<LeaseQueue>,
    state: Mutex<StopState>,
    stopped: Condvar,
}

/// Cloneable handle stopping the leader's RPC service.
///
/// The first stop wins; later ones are ignored except that abort causes are
/// still recorded. Stopping closes the lease queue so blocked leases return.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

impl ServiceHandle {
    pub fn new(queue: Arc<LeaseQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                state: Mutex::new(StopState::default()),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Stop the service. Returns `false` if it was already stopped.
    pub fn stop(&self, reason: StopReason) -> bool {
        let mut state = self.inner.state.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        drop(state);

        tracing::debug!(?reason, "stopping RPC service");
        self.inner.queue.close();
        self.inner.stopped.notify_all();
        true
    }

    /// Abort the run because of `cause`.
    pub fn abort(&self, cause: FailureCause) {
        {
            let mut state = self.inner.state.lock();
            if !state.aborts.contains(&cause) {
                state.aborts.push(cause);
            }
        }
        self.stop(StopReason::Aborted(cause));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.inner.state.lock().reason
    }

    /// Abort causes in the order they were first raised
    pub fn aborts(&self) -> Vec<FailureCause> {
        self.inner.state.lock().aborts.clone()
    }

    /// Block until stopped
    pub fn wait(&self) -> StopReason {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(reason) = state.reason {
                return reason;
            }
            self.inner.stopped.wait(&mut state);
        }
    }

    /// Block until stopped or `timeout` elapses. Returns whether stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.reason.is_none() {
            self.inner.stopped.wait_for(&mut state, timeout);
        }
        state.reason.is_some()
    }
}
