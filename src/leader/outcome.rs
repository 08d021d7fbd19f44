//! Final run verdict

use serde::Serialize;

use crate::signal::SignalState;

use super::handle::{FailureCause, ServiceHandle};
use super::metrics::MetricsSnapshot;
use super::queue::{LeaseQueue, QueueError};
use super::watchdog::OUTSTANDING_SAMPLE_SIZE;

/// How the leader's run ended
#[derive(Debug, Clone, Serialize)]
pub struct LeaderOutcome {
    pub exit_code: i32,
    /// Subsystems that failed the run, in the order they are checked
    pub causes: Vec<FailureCause>,
    pub total: usize,
    pub completed: usize,
    pub outstanding: usize,
    /// Up to ten identifiers that never completed
    pub outstanding_sample: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_message: Option<String>,
    pub metrics: MetricsSnapshot,
}

impl LeaderOutcome {
    pub(crate) fn evaluate(
        queue: &LeaseQueue,
        handle: &ServiceHandle,
        signals: &SignalState,
        watchdog_failed: bool,
        reporter_failed: bool,
        metrics: MetricsSnapshot,
    ) -> Result<Self, QueueError> {
        let completed = queue.completed_size()?;
        let outstanding_tests = queue.outstanding()?;
        let outstanding = outstanding_tests.len();

        let mut causes = handle.aborts();
        let mut add = |cause: FailureCause, failed: bool| {
            if failed && !causes.contains(&cause) {
                causes.push(cause);
            }
        };
        add(FailureCause::Watchdog, watchdog_failed);
        add(FailureCause::Signal, signals.any());
        add(FailureCause::CountMismatch, completed + outstanding != queue.total());
        add(FailureCause::Reporter, reporter_failed);

        let exit_code = match signals.exit_code() {
            Some(code) => code,
            None if !causes.is_empty() => 1,
            None => 0,
        };

        Ok(Self {
            exit_code,
            causes,
            total: queue.total(),
            completed,
            outstanding,
            outstanding_sample: outstanding_tests
                .into_iter()
                .take(OUTSTANDING_SAMPLE_SIZE)
                .collect(),
            signal_message: signals.message(),
            metrics,
        })
    }

    pub fn is_success(&self) -> bool {
        self.causes.is_empty()
    }

    /// Log the final status lines
    pub fn log(&self) {
        if self.is_success() {
            tracing::info!("Build succeeded. Tests processed: {}", self.completed);
            return;
        }

        tracing::error!("Build failed");
        for cause in &self.causes {
            match cause {
                FailureCause::CountMismatch => tracing::error!(
                    "count mismatch: {} completed + {} outstanding != {} total",
                    self.completed,
                    self.outstanding,
                    self.total
                ),
                FailureCause::Signal => tracing::error!(
                    "{}",
                    self.signal_message.as_deref().unwrap_or("RECEIVED SIGNAL.")
                ),
                cause => tracing::error!(cause = %cause, "failed subsystem"),
            }
        }
        tracing::error!(
            "Tests processed: {}. Tests left: {}",
            self.completed,
            self.outstanding
        );
        if !self.outstanding_sample.is_empty() {
            tracing::info!(
                "{} tests not executed, showing {}:\n{}",
                self.outstanding,
                self.outstanding_sample.len(),
                self.outstanding_sample.join("\n")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::metrics::RunMetrics;
    use crate::signal::Signal;
    use std::sync::Arc;

    fn drained(tests: &[&str]) -> (Arc<LeaseQueue>, ServiceHandle) {
        let queue = Arc::new(LeaseQueue::new(tests.iter().map(|t| t.to_string()).collect()));
        while let Some(test) = queue.try_lease().unwrap() {
            queue.release(&test).unwrap();
        }
        let handle = ServiceHandle::new(Arc::clone(&queue));
        (queue, handle)
    }

    fn evaluate(queue: &LeaseQueue, handle: &ServiceHandle, signals: &SignalState, watchdog: bool, reporter: bool) -> LeaderOutcome {
        LeaderOutcome::evaluate(queue, handle, signals, watchdog, reporter, RunMetrics::new().snapshot()).unwrap()
    }

    #[test]
    fn test_success() {
        let (queue, handle) = drained(&["a", "b"]);
        let outcome = evaluate(&queue, &handle, &SignalState::new(), false, false);

        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.outstanding, 0);
    }

    #[test]
    fn test_reporter_failures_fail_the_run() {
        let (queue, handle) = drained(&["a"]);
        let outcome = evaluate(&queue, &handle, &SignalState::new(), false, true);

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.causes, vec![FailureCause::Reporter]);
    }

    #[test]
    fn test_watchdog_failure_lists_outstanding() {
        let tests: Vec<String> = (0..15).map(|i| format!("spec/t{}_spec.rb", i)).collect();
        let queue = LeaseQueue::new(tests);
        let handle = ServiceHandle::new(Arc::new(LeaseQueue::new(vec![])));
        let outcome = evaluate(&queue, &handle, &SignalState::new(), true, false);

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.causes, vec![FailureCause::Watchdog]);
        assert_eq!(outcome.outstanding, 15);
        assert_eq!(outcome.outstanding_sample.len(), 10);
    }

    #[test]
    fn test_signal_decides_exit_code() {
        let (queue, handle) = drained(&["a"]);
        let signals = SignalState::new();
        signals.record(Signal::Terminate);
        handle.abort(FailureCause::FailedWorker);

        let outcome = evaluate(&queue, &handle, &signals, false, false);
        assert_eq!(outcome.exit_code, 15);
        assert_eq!(outcome.causes, vec![FailureCause::FailedWorker, FailureCause::Signal]);
    }
}
