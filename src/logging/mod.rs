//! Log output for the leader and worker processes
//!
//! Console output goes to stderr, filtered by `RUST_LOG` (default `info`).
//! Everything at debug level and above is also appended to a log file, so a
//! failed run can be investigated without rerunning it with `RUST_LOG=debug`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Console filter when `RUST_LOG` is unset
pub const DEFAULT_CONSOLE_FILTER: &str = "info";

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open debug log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("logger already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

fn open_debug_log(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Console layer plus, when `debug_log` is set, a debug-level file layer.
pub fn subscriber(debug_log: Option<&Path>) -> Result<impl Subscriber + Send + Sync + 'static, LoggingError> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_CONSOLE_FILTER));
    let console = fmt::layer().with_writer(io::stderr).with_filter(console_filter);

    let file = match debug_log {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(open_debug_log(path)?))
                .with_filter(LevelFilter::DEBUG),
        ),
        None => None,
    };

    Ok(tracing_subscriber::registry().with(console).with(file))
}

/// Install [`subscriber`] as the process-wide default.
pub fn init(debug_log: Option<&Path>) -> Result<(), LoggingError> {
    subscriber(debug_log)?.try_init()?;
    Ok(())
}
