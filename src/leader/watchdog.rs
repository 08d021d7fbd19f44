//! Watchdog
//!
//! Runs on its own thread next to the RPC service. Each tick it reclaims
//! leases that outlived their test timeout and decides whether the run is
//! finished, interrupted or stuck. The first terminal condition stops the
//! service and ends the thread.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{DistribConfig, TimeoutPolicy, TimeoutStrategy};
use crate::signal::SignalState;

use super::handle::{FailureCause, ServiceHandle, StopReason};
use super::metrics::RunMetrics;
use super::queue::{LeaseQueue, QueueError};

/// Outstanding identifiers printed when the run is stuck
pub const OUTSTANDING_SAMPLE_SIZE: usize = 10;

/// Result of one watchdog pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStep {
    Continue,
    Stopped,
}

pub struct Watchdog {
    queue: Arc<LeaseQueue>,
    handle: ServiceHandle,
    signals: Arc<SignalState>,
    metrics: Arc<RunMetrics>,
    timeouts: TimeoutPolicy,
    strategy: TimeoutStrategy,
    first_test_picked_timeout: Duration,
    tests_processing_stopped_timeout: Duration,
    interval: Duration,
    failed: AtomicBool,
}

impl Watchdog {
    pub fn new(
        config: &DistribConfig,
        timeouts: TimeoutPolicy,
        queue: Arc<LeaseQueue>,
        handle: ServiceHandle,
        signals: Arc<SignalState>,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            queue,
            handle,
            signals,
            metrics,
            timeouts,
            strategy: config.timeout_strategy,
            first_test_picked_timeout: config.first_test_picked_timeout,
            tests_processing_stopped_timeout: config.tests_processing_stopped_timeout,
            interval: config.watchdog_interval,
            failed: AtomicBool::new(false),
        }
    }

    /// Whether a liveness timeout fired
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Run the watchdog loop on a dedicated thread.
    pub fn spawn(self: Arc<Self>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || self.run())
    }

    /// Tick until a terminal condition or until the service stops.
    pub fn run(&self) {
        loop {
            if self.handle.is_stopped() {
                return;
            }

            match self.tick() {
                Ok(WatchdogStep::Stopped) => return,
                Ok(WatchdogStep::Continue) => {}
                Err(e) => {
                    tracing::error!(error = %e, "watchdog failed");
                    self.handle.abort(FailureCause::InternalError);
                    return;
                }
            }

            if self.handle.wait_timeout(self.interval) {
                return;
            }
        }
    }

    /// One pass over the queue.
    pub fn tick(&self) -> Result<WatchdogStep, QueueError> {
        if let Some(message) = self.signals.message() {
            tracing::warn!("{} Stopping.", message);
            self.handle.stop(StopReason::Signal);
            return Ok(WatchdogStep::Stopped);
        }

        self.reclaim_stale_leases()?;

        if self.queue.is_empty()? {
            tracing::info!("Queue is empty. Stopping.");
            self.handle.stop(StopReason::Drained);
            return Ok(WatchdogStep::Stopped);
        }

        if let Some(diagnostic) = self.liveness_failure()? {
            tracing::error!("{}", diagnostic);
            self.log_outstanding()?;
            self.failed.store(true, Ordering::SeqCst);
            self.handle.stop(StopReason::Watchdog);
            return Ok(WatchdogStep::Stopped);
        }

        Ok(WatchdogStep::Continue)
    }

    fn reclaim_stale_leases(&self) -> Result<(), QueueError> {
        let now = Instant::now();
        let stale = self.queue.select_leased(|test, leased_at| {
            now.saturating_duration_since(leased_at) > self.timeouts.timeout_for(test)
        })?;

        for test in stale.keys() {
            let timeout = self.timeouts.timeout_for(test);
            match self.strategy {
                TimeoutStrategy::Repush => {
                    tracing::warn!(
                        test = %test,
                        timeout = %format_duration(timeout),
                        "test timed out, repushing"
                    );
                    self.queue.repush(test)?;
                    self.metrics.watchdog_repushed(test, timeout);
                }
                TimeoutStrategy::Release => {
                    tracing::warn!(
                        test = %test,
                        timeout = %format_duration(timeout),
                        "test timed out, releasing"
                    );
                    self.queue.release(test)?;
                    self.metrics.watchdog_released(test, timeout);
                }
            }
        }
        Ok(())
    }

    fn liveness_failure(&self) -> Result<Option<String>, QueueError> {
        if !self.queue.is_visited()? {
            let waited = self.queue.initialized_at().elapsed();
            if waited > self.first_test_picked_timeout {
                return Ok(Some(format!(
                    "Looks like workers failed to start: no test was picked within {}",
                    format_duration(self.first_test_picked_timeout)
                )));
            }
            return Ok(None);
        }

        let idle = self.queue.last_activity_at()?.elapsed();
        if idle > self.tests_processing_stopped_timeout {
            return Ok(Some(format!(
                "Tests processing stopped: no test was picked within {}",
                format_duration(self.tests_processing_stopped_timeout)
            )));
        }
        Ok(None)
    }

    fn log_outstanding(&self) -> Result<(), QueueError> {
        let outstanding = self.queue.outstanding()?;
        let shown = outstanding.len().min(OUTSTANDING_SAMPLE_SIZE);
        tracing::info!(
            "{} tests not executed, showing {}:\n{}",
            outstanding.len(),
            shown,
            outstanding[..shown].join("\n")
        );
        Ok(())
    }
}

/// Short human form, e.g. `5m`, `1m 30s`, `0.5s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if duration.subsec_millis() != 0 && secs < 60 {
        return format!("{}s", duration.as_secs_f64());
    }

    let (minutes, seconds) = (secs / 60, secs % 60);
    match (minutes, seconds) {
        (0, s) => format!("{}s", s),
        (m, 0) => format!("{}m", m),
        (m, s) => format!("{}m {}s", m, s),
    }
}
