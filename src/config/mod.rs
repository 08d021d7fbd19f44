//! Run configuration
//!
//! Configuration is resolved once at startup from three layers and then
//! passed by reference to the leader, watchdog, policy and worker:
//! 1. Built-in defaults
//! 2. TOML config file (`distrib.toml`)
//! 3. CLI overrides

mod defaults;
mod layers;
mod timeout;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use defaults::*;
pub use layers::{deep_merge, merge_layers, toml_to_json};
pub use timeout::{TimeoutOverride, TimeoutPolicy};

/// What the watchdog does with a test whose lease timed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStrategy {
    /// Put the test back in the queue for another worker
    #[default]
    Repush,
    /// Give up on the test and mark it completed
    Release,
}

/// Which retry policy the leader uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Default,
    /// Stop retrying once the same failure keeps coming back
    RepeatedFailureLimited,
}

/// Retry and worker-failure tolerance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: PolicyKind,
    /// Retries allowed per test
    pub retry_attempts: u32,
    /// Error classes that make a failure retryable; empty means any
    pub retryable_exceptions: Vec<String>,
    /// Error classes that abort the run when a worker fails with them
    pub fatal_worker_failures: Vec<String>,
    /// Worker failures tolerated before the run is aborted
    pub failed_workers_threshold: u32,
    /// Occurrences of one failure signature allowed per test (repeated_failure_limited only)
    pub repeated_error_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Default,
            retry_attempts: 0,
            retryable_exceptions: Vec::new(),
            fatal_worker_failures: Vec::new(),
            failed_workers_threshold: 0,
            repeated_error_limit: DEFAULT_REPEATED_ERROR_LIMIT,
        }
    }
}

/// Where the leader finds tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsConfig {
    /// Directory the include/exclude globs are evaluated against
    pub root: PathBuf,
    /// Glob patterns of test files to enqueue
    pub include: Vec<String>,
    /// Glob patterns removed from the include set
    pub exclude: Vec<String>,
    /// Explicit identifiers; when set, globs are ignored
    pub list: Vec<String>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            include: vec![DEFAULT_TEST_GLOB.to_string()],
            exclude: Vec::new(),
            list: Vec::new(),
        }
    }
}

/// Effective configuration for a leader or a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistribConfig {
    /// Address the leader listens on
    pub listen_addr: String,

    /// Address workers connect to
    pub leader_addr: String,

    /// Default per-test timeout
    #[serde(with = "seconds")]
    pub test_timeout: Duration,

    /// Per-pattern test timeouts, first match wins
    pub test_timeouts: Vec<TimeoutOverride>,

    /// How long to wait for the first lease before assuming workers failed to start
    #[serde(with = "seconds")]
    pub first_test_picked_timeout: Duration,

    /// How long leasing may stall once it started
    #[serde(with = "seconds")]
    pub tests_processing_stopped_timeout: Duration,

    pub timeout_strategy: TimeoutStrategy,

    /// Connection attempts a worker makes before giving up
    pub leader_connection_attempts: u32,

    /// Pause between connection attempts
    #[serde(with = "seconds")]
    pub leader_connection_interval: Duration,

    /// Watchdog polling interval
    #[serde(with = "seconds")]
    pub watchdog_interval: Duration,

    pub retry: RetryConfig,

    /// Regexes over terminal error messages that must not abort the run
    pub benign_exception_patterns: Vec<String>,

    pub tests: TestsConfig,

    /// Run seed handed to workers; random when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Opaque worker profile
    pub profile: Value,

    /// File receiving debug-level logs; empty disables it
    pub debug_log: PathBuf,

    /// Command the leader runs once the run is over, before exiting
    pub on_finish: Vec<String>,
}

impl Default for DistribConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            leader_addr: DEFAULT_LEADER_ADDR.to_string(),
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
            test_timeouts: Vec::new(),
            first_test_picked_timeout: Duration::from_secs(DEFAULT_FIRST_TEST_PICKED_TIMEOUT_SECS),
            tests_processing_stopped_timeout: Duration::from_secs(
                DEFAULT_TESTS_PROCESSING_STOPPED_TIMEOUT_SECS,
            ),
            timeout_strategy: TimeoutStrategy::Repush,
            leader_connection_attempts: DEFAULT_LEADER_CONNECTION_ATTEMPTS,
            leader_connection_interval: Duration::from_secs(DEFAULT_LEADER_CONNECTION_INTERVAL_SECS),
            watchdog_interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            retry: RetryConfig::default(),
            benign_exception_patterns: Vec::new(),
            tests: TestsConfig::default(),
            seed: None,
            profile: Value::Object(serde_json::Map::new()),
            debug_log: PathBuf::from(DEFAULT_DEBUG_LOG),
            on_finish: Vec::new(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl DistribConfig {
    /// Resolve the configuration from defaults, an optional file and CLI overrides
    pub fn load(path: Option<&Path>, overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![builtin_layer()?];

        if let Some(path) = path {
            layers.push(Self::load_toml_file(path)?);
        }

        if let Some(overrides) = overrides {
            layers.push(overrides);
        }

        let merged = merge_layers(layers);
        let config: Self = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text on top of the defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let value: toml::Value =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))?;
        let merged = deep_merge(builtin_layer()?, toml_to_json(value));
        let config: Self = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn load_toml_file(path: &Path) -> Result<Value, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Ok(toml_to_json(value))
    }

    /// Check bounds and compile every pattern once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("test_timeout", self.test_timeout),
            ("first_test_picked_timeout", self.first_test_picked_timeout),
            ("tests_processing_stopped_timeout", self.tests_processing_stopped_timeout),
            ("watchdog_interval", self.watchdog_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.leader_connection_attempts == 0 {
            return Err(ConfigError::Invalid(
                "leader_connection_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.repeated_error_limit == 0 {
            return Err(ConfigError::Invalid(
                "retry.repeated_error_limit must be at least 1".to_string(),
            ));
        }

        self.timeout_policy()?;
        self.benign_patterns()?;
        Ok(())
    }

    /// `debug_log`, unless disabled
    pub fn debug_log_path(&self) -> Option<&Path> {
        (!self.debug_log.as_os_str().is_empty()).then_some(self.debug_log.as_path())
    }

    /// Per-test timeout resolution built from `test_timeout` and `test_timeouts`
    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        TimeoutPolicy::with_overrides(self.test_timeout, &self.test_timeouts)
    }

    /// Compiled `benign_exception_patterns`
    pub fn benign_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.benign_exception_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

fn builtin_layer() -> Result<Value, ConfigError> {
    serde_json::to_value(DistribConfig::default()).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Durations expressed as (possibly fractional) seconds
pub(crate) mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DistribConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.test_timeout, Duration::from_secs(60));
        assert_eq!(config.first_test_picked_timeout, Duration::from_secs(600));
        assert_eq!(config.tests_processing_stopped_timeout, Duration::from_secs(300));
        assert_eq!(config.timeout_strategy, TimeoutStrategy::Repush);
        assert_eq!(config.leader_connection_attempts, 200);
        assert_eq!(config.debug_log_path(), Some(Path::new("distrib.log")));
        assert!(config.on_finish.is_empty());
    }

    #[test]
    fn test_debug_log_and_on_finish_from_toml() {
        let config = DistribConfig::from_toml_str(
            r#"
            debug_log = ""
            on_finish = ["sh", "-c", "echo done"]
            "#,
        )
        .unwrap();
        assert_eq!(config.debug_log_path(), None);
        assert_eq!(config.on_finish, vec!["sh", "-c", "echo done"]);
    }

    #[test]
    fn test_from_toml_overrides_defaults() {
        let config = DistribConfig::from_toml_str(
            r#"
            test_timeout = 30
            timeout_strategy = "release"

            [retry]
            policy = "repeated_failure_limited"
            retry_attempts = 2
            retryable_exceptions = ["Net::ReadTimeout"]

            [[test_timeouts]]
            pattern = "spec/slow/**"
            timeout = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.test_timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_strategy, TimeoutStrategy::Release);
        assert_eq!(config.retry.policy, PolicyKind::RepeatedFailureLimited);
        assert_eq!(config.retry.retry_attempts, 2);
        // untouched nested defaults survive the merge
        assert_eq!(config.retry.repeated_error_limit, 1);
        assert_eq!(config.tests.include, vec![DEFAULT_TEST_GLOB.to_string()]);

        let policy = config.timeout_policy().unwrap();
        assert_eq!(policy.timeout_for("spec/slow/big_spec.rb"), Duration::from_secs(300));
        assert_eq!(policy.timeout_for("spec/fast_spec.rb"), Duration::from_secs(30));
    }

    #[test]
    fn test_fractional_seconds() {
        let config = DistribConfig::from_toml_str("watchdog_interval = 0.25").unwrap();
        assert_eq!(config.watchdog_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = DistribConfig::from_toml_str("test_timeout = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let result = DistribConfig::from_toml_str("timeout_strategy = \"drop\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_benign_pattern_rejected() {
        let result = DistribConfig::from_toml_str("benign_exception_patterns = [\"(unclosed\"]");
        assert!(matches!(result, Err(ConfigError::Pattern { .. })));
    }

    #[test]
    fn test_load_file_then_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr = \"127.0.0.1:9000\"\nleader_connection_attempts = 5\n[profile]\ncommand = [\"true\"]"
        )
        .unwrap();

        let overrides = serde_json::json!({ "leader_connection_attempts": 7, "seed": 42 });
        let config = DistribConfig::load(Some(file.path()), Some(overrides)).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.leader_connection_attempts, 7);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.profile["command"][0], "true");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = DistribConfig::load(Some(Path::new("/nonexistent/distrib.toml")), None);
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
