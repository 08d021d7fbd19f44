//! Leader process
//!
//! Owns the queue of tests for one run, hands them out to workers over RPC,
//! accounts for their results and decides whether the run succeeded.

pub mod handle;
pub mod metrics;
pub mod outcome;
pub mod policy;
pub mod queue;
pub mod reporter;
pub mod server;
pub mod service;
pub mod watchdog;

use std::io;
use std::net::TcpListener;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::{ConfigError, DistribConfig, TimeoutPolicy};
use crate::signal::SignalState;

pub use handle::{FailureCause, ServiceHandle, StopReason};
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use outcome::LeaderOutcome;
pub use policy::{policy_for, DefaultPolicy, ErrorPolicy, RepeatedFailurePolicy};
pub use queue::{LeaseQueue, QueueCounts, QueueError};
pub use reporter::{CollectingReporter, Reporter, RunSummary};
pub use server::RpcServer;
pub use service::LeaderService;
pub use watchdog::{Watchdog, WatchdogStep};

/// Leader errors
#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Called once the run is over, after the reporter finished
pub type OnFinish = Box<dyn FnOnce(&LeaderOutcome) + Send>;

/// Leader run under construction
pub struct Leader {
    config: DistribConfig,
    tests: Vec<String>,
    reporter: Box<dyn Reporter>,
    policy: Option<Box<dyn ErrorPolicy>>,
    timeouts: Option<TimeoutPolicy>,
    signals: Arc<SignalState>,
    seed: Option<u64>,
    on_finish: Option<OnFinish>,
}

impl Leader {
    pub fn new(config: DistribConfig, tests: Vec<String>, reporter: Box<dyn Reporter>) -> Self {
        Self {
            seed: config.seed,
            config,
            tests,
            reporter,
            policy: None,
            timeouts: None,
            signals: Arc::new(SignalState::new()),
            on_finish: None,
        }
    }

    /// Use a custom retry policy instead of the configured one
    pub fn with_policy(mut self, policy: Box<dyn ErrorPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Use a custom per-test timeout instead of the configured one
    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Share the process signal state
    pub fn with_signals(mut self, signals: Arc<SignalState>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Run `hook` with the outcome before it is logged
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&LeaderOutcome) + Send + 'static,
    {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Build the run state and start the watchdog.
    pub fn start(self) -> Result<LeaderRun, LeaderError> {
        let timeouts = match self.timeouts {
            Some(timeouts) => timeouts,
            None => self.config.timeout_policy()?,
        };
        let policy = self
            .policy
            .unwrap_or_else(|| policy_for(&self.config.retry));
        let seed = self.seed.unwrap_or_else(rand::random);

        let queue = Arc::new(LeaseQueue::new(self.tests));
        let handle = ServiceHandle::new(Arc::clone(&queue));
        let metrics = Arc::new(RunMetrics::new());

        let service = Arc::new(LeaderService::new(
            &self.config,
            Arc::clone(&queue),
            handle.clone(),
            Arc::clone(&metrics),
            self.reporter,
            policy,
            seed,
        )?);

        let watchdog = Arc::new(Watchdog::new(
            &self.config,
            timeouts,
            Arc::clone(&queue),
            handle.clone(),
            Arc::clone(&self.signals),
            Arc::clone(&metrics),
        ));
        let watchdog_thread = Arc::clone(&watchdog)
            .spawn()
            .map_err(|source| LeaderError::Spawn {
                name: "watchdog",
                source,
            })?;

        metrics.queue_exposed();
        tracing::info!(tests = queue.total(), seed, "leader started");

        Ok(LeaderRun {
            queue,
            handle,
            metrics,
            service,
            watchdog,
            watchdog_thread,
            signals: self.signals,
            on_finish: self.on_finish,
        })
    }

    /// Run to completion serving workers on `config.listen_addr`.
    pub fn run(self) -> Result<LeaderOutcome, LeaderError> {
        let addr = self.config.listen_addr.clone();
        let listener = TcpListener::bind(&addr).map_err(|source| LeaderError::Bind { addr, source })?;
        self.serve(listener)
    }

    /// Run to completion serving workers on `listener`.
    pub fn serve(self, listener: TcpListener) -> Result<LeaderOutcome, LeaderError> {
        let run = self.start()?;
        let server = RpcServer::new(listener, run.service(), run.handle());
        let server_thread = match server.spawn() {
            Ok(thread) => thread,
            Err(source) => {
                run.handle.abort(FailureCause::InternalError);
                run.finish()?;
                return Err(LeaderError::Spawn {
                    name: "rpc-accept",
                    source,
                });
            }
        };

        let outcome = run.finish();
        if server_thread.join().is_err() {
            tracing::error!("RPC server thread panicked");
        }
        outcome
    }
}

/// A started leader: watchdog running, service accepting requests
pub struct LeaderRun {
    queue: Arc<LeaseQueue>,
    handle: ServiceHandle,
    metrics: Arc<RunMetrics>,
    service: Arc<LeaderService>,
    watchdog: Arc<Watchdog>,
    watchdog_thread: JoinHandle<()>,
    signals: Arc<SignalState>,
    on_finish: Option<OnFinish>,
}

impl LeaderRun {
    pub fn service(&self) -> Arc<LeaderService> {
        Arc::clone(&self.service)
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn queue(&self) -> Arc<LeaseQueue> {
        Arc::clone(&self.queue)
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Wait for the service to stop and compute the outcome.
    pub fn finish(self) -> Result<LeaderOutcome, LeaderError> {
        let reason = self.handle.wait();
        tracing::debug!(?reason, "service stopped");

        if self.watchdog_thread.join().is_err() {
            tracing::error!("watchdog thread panicked");
            self.handle.abort(FailureCause::InternalError);
        }

        let outcome = LeaderOutcome::evaluate(
            &self.queue,
            &self.handle,
            &self.signals,
            self.watchdog.is_failed(),
            self.service.reporter_has_failures(),
            self.metrics.snapshot(),
        )?;

        self.service.run_finished(&RunSummary {
            completed: outcome.completed,
            outstanding: outcome.outstanding,
            failed: !outcome.is_success(),
        });

        if let Some(hook) = self.on_finish {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(&outcome))).is_err() {
                tracing::error!("on_finish hook panicked");
            }
        }

        outcome.log();
        Ok(outcome)
    }
}
