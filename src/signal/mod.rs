//! Signal handling for graceful shutdown (SIGINT/SIGTERM)
//!
//! Records which termination signals the process received so that the
//! leader's watchdog and the worker's consumption loop can decide how to
//! wind down.
//!
//! - First SIGINT: recorded; the current test finishes and is reported.
//! - Second SIGINT: force flag set, the process exits immediately with code 2.
//! - SIGTERM: recorded; a worker abandons the in-flight test without
//!   reporting it, a leader stops serving.
//!
//! Exit codes are part of the external contract: INT → 2, TERM → 15.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code used when the run was interrupted (SIGINT).
pub const EXIT_CODE_INTERRUPT: i32 = 2;

/// Exit code used when the run was terminated (SIGTERM).
pub const EXIT_CODE_TERMINATE: i32 = 15;

/// Termination signals the process reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    /// Short signal name, as used in log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Terminate => "TERM",
        }
    }

    /// Process exit code for a shutdown caused by this signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Signal::Interrupt => EXIT_CODE_INTERRUPT,
            Signal::Terminate => EXIT_CODE_TERMINATE,
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Signal::Interrupt => 1,
            Signal::Terminate => 2,
        }
    }

    fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            1 => Some(Signal::Interrupt),
            2 => Some(Signal::Terminate),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Action to take after recording a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Recorded; shut down gracefully
    Recorded,
    /// Second interrupt: exit immediately
    ForceExit,
}

/// Process-wide record of received signals.
///
/// Only atomics, so recording is safe from inside a signal handler. Never
/// reset during a run.
#[derive(Debug, Default)]
pub struct SignalState {
    /// Bit set of received signals
    received: AtomicU8,
    /// First signal received (decides the exit code)
    first: AtomicU8,
    /// Second SIGINT received
    force_interrupt: AtomicBool,
}

impl SignalState {
    /// Create an empty signal state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signal and return what the process should do about it
    pub fn record(&self, signal: Signal) -> SignalAction {
        let previous = self.received.fetch_or(signal.bit(), Ordering::SeqCst);
        let _ = self
            .first
            .compare_exchange(0, signal.bit(), Ordering::SeqCst, Ordering::SeqCst);

        if signal == Signal::Interrupt && previous & Signal::Interrupt.bit() != 0 {
            self.force_interrupt.store(true, Ordering::SeqCst);
            return SignalAction::ForceExit;
        }

        SignalAction::Recorded
    }

    /// Whether any signal was received
    pub fn any(&self) -> bool {
        self.received.load(Ordering::SeqCst) != 0
    }

    /// Whether the given signal was received
    pub fn received(&self, signal: Signal) -> bool {
        self.received.load(Ordering::SeqCst) & signal.bit() != 0
    }

    /// Whether SIGINT was received twice
    pub fn force_interrupt(&self) -> bool {
        self.force_interrupt.load(Ordering::SeqCst)
    }

    /// Whether in-flight work must be abandoned without reporting
    pub fn must_abandon(&self) -> bool {
        self.received(Signal::Terminate) || self.force_interrupt()
    }

    /// The first signal received, if any
    pub fn first(&self) -> Option<Signal> {
        Signal::from_bit(self.first.load(Ordering::SeqCst))
    }

    /// All received signals, interrupt first
    pub fn signals(&self) -> Vec<Signal> {
        [Signal::Interrupt, Signal::Terminate]
            .into_iter()
            .filter(|s| self.received(*s))
            .collect()
    }

    /// Exit code derived from the first received signal
    pub fn exit_code(&self) -> Option<i32> {
        self.first().map(|s| s.exit_code())
    }

    /// Human-readable summary, e.g. `RECEIVED SIGNAL INT, TERM.`
    pub fn message(&self) -> Option<String> {
        if !self.any() {
            return None;
        }
        let names: Vec<&str> = self.signals().iter().map(|s| s.name()).collect();
        Some(format!("RECEIVED SIGNAL {}.", names.join(", ")))
    }
}

/// Signal installation errors
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal handlers are already installed")]
    AlreadyInstalled,

    #[error("failed to install handler for {signal}: {message}")]
    Install { signal: Signal, message: String },
}

/// Install SIGINT and SIGTERM handlers recording into `state`.
///
/// Must be called once at program startup.
pub fn install(state: Arc<SignalState>) -> Result<(), SignalError> {
    imp::install(state)
}

#[cfg(unix)]
mod imp {
    use super::{Signal, SignalAction, SignalError, SignalState, EXIT_CODE_INTERRUPT};
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    use std::sync::{Arc, OnceLock};

    static INSTALLED: OnceLock<Arc<SignalState>> = OnceLock::new();

    pub(super) fn install(state: Arc<SignalState>) -> Result<(), SignalError> {
        INSTALLED
            .set(state)
            .map_err(|_| SignalError::AlreadyInstalled)?;

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for (raw, signal) in [
            (signal::Signal::SIGINT, Signal::Interrupt),
            (signal::Signal::SIGTERM, Signal::Terminate),
        ] {
            // SAFETY: the handler only touches atomics and calls
            // async-signal-safe libc functions.
            unsafe { signal::sigaction(raw, &action) }.map_err(|e| SignalError::Install {
                signal,
                message: e.to_string(),
            })?;
        }

        Ok(())
    }

    extern "C" fn on_signal(raw: libc::c_int) {
        let Some(state) = INSTALLED.get() else {
            return;
        };

        let signal = if raw == libc::SIGINT {
            Signal::Interrupt
        } else {
            Signal::Terminate
        };

        match state.record(signal) {
            SignalAction::ForceExit => {
                write_stderr(b"\nReceived second SIGINT. Exiting...\n");
                // SAFETY: _exit is async-signal-safe.
                unsafe { libc::_exit(EXIT_CODE_INTERRUPT) };
            }
            SignalAction::Recorded => {
                let message: &[u8] = match signal {
                    Signal::Interrupt => b"\nReceived INT\n",
                    Signal::Terminate => b"\nReceived TERM\n",
                };
                write_stderr(message);
            }
        }
    }

    fn write_stderr(message: &[u8]) {
        // SAFETY: write(2) is async-signal-safe; the buffer outlives the call.
        unsafe {
            libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{SignalError, SignalState};
    use std::sync::Arc;

    pub(super) fn install(_state: Arc<SignalState>) -> Result<(), SignalError> {
        tracing::warn!("signal handling is not supported on this platform");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_initial() {
        let state = SignalState::new();
        assert!(!state.any());
        assert!(!state.force_interrupt());
        assert_eq!(state.exit_code(), None);
        assert_eq!(state.message(), None);
    }

    #[test]
    fn test_first_interrupt_is_recorded() {
        let state = SignalState::new();
        let action = state.record(Signal::Interrupt);

        assert_eq!(action, SignalAction::Recorded);
        assert!(state.received(Signal::Interrupt));
        assert!(!state.received(Signal::Terminate));
        assert!(!state.must_abandon());
        assert_eq!(state.exit_code(), Some(2));
    }

    #[test]
    fn test_second_interrupt_forces_exit() {
        let state = SignalState::new();

        state.record(Signal::Interrupt);
        let action = state.record(Signal::Interrupt);

        assert_eq!(action, SignalAction::ForceExit);
        assert!(state.force_interrupt());
        assert!(state.must_abandon());
    }

    #[test]
    fn test_terminate_exit_code() {
        let state = SignalState::new();
        assert_eq!(state.record(Signal::Terminate), SignalAction::Recorded);
        assert!(state.must_abandon());
        assert_eq!(state.exit_code(), Some(15));
    }

    #[test]
    fn test_exit_code_follows_first_signal() {
        let state = SignalState::new();
        state.record(Signal::Terminate);
        state.record(Signal::Interrupt);

        assert_eq!(state.first(), Some(Signal::Terminate));
        assert_eq!(state.exit_code(), Some(15));
        assert_eq!(state.message().unwrap(), "RECEIVED SIGNAL INT, TERM.");
    }

    #[test]
    fn test_terminate_twice_does_not_force() {
        let state = SignalState::new();
        state.record(Signal::Terminate);
        assert_eq!(state.record(Signal::Terminate), SignalAction::Recorded);
        assert!(!state.force_interrupt());
    }
}
