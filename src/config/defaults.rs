//! Built-in defaults (layer 1)

/// Leader listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8787";

/// Address workers connect to
pub const DEFAULT_LEADER_ADDR: &str = "127.0.0.1:8787";

/// Per-test timeout (1 minute)
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 60;

/// Time allowed before the first test is picked (10 minutes)
pub const DEFAULT_FIRST_TEST_PICKED_TIMEOUT_SECS: u64 = 10 * 60;

/// Time allowed without any lease once processing started (5 minutes)
pub const DEFAULT_TESTS_PROCESSING_STOPPED_TIMEOUT_SECS: u64 = 5 * 60;

pub const DEFAULT_LEADER_CONNECTION_ATTEMPTS: u32 = 200;

pub const DEFAULT_LEADER_CONNECTION_INTERVAL_SECS: u64 = 1;

pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 1;

pub const DEFAULT_REPEATED_ERROR_LIMIT: u32 = 1;

/// Test files enqueued when no pattern is configured
pub const DEFAULT_TEST_GLOB: &str = "spec/**/*_spec.rb";

/// Debug-level log written next to the console output
pub const DEFAULT_DEBUG_LOG: &str = "distrib.log";
