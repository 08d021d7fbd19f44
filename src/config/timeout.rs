//! Per-test timeout resolution

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Timeout for tests whose identifier matches `pattern`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutOverride {
    pub pattern: String,
    #[serde(with = "super::seconds")]
    pub timeout: Duration,
}

type TimeoutFn = Arc<dyn Fn(&str) -> Duration + Send + Sync>;

#[derive(Clone)]
enum Resolution {
    Constant(Duration),
    Patterns {
        fallback: Duration,
        set: GlobSet,
        timeouts: Vec<Duration>,
    },
    Custom(TimeoutFn),
}

/// Maps a test identifier to the time a worker may hold its lease.
#[derive(Clone)]
pub struct TimeoutPolicy {
    resolution: Resolution,
}

impl TimeoutPolicy {
    /// Same timeout for every test.
    pub fn constant(timeout: Duration) -> Self {
        Self {
            resolution: Resolution::Constant(timeout),
        }
    }

    /// Glob overrides tried in order, falling back to `fallback`.
    pub fn with_overrides(fallback: Duration, overrides: &[TimeoutOverride]) -> Result<Self, ConfigError> {
        if overrides.is_empty() {
            return Ok(Self::constant(fallback));
        }

        let mut builder = GlobSetBuilder::new();
        for entry in overrides {
            if entry.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "timeout for '{}' must be greater than 0",
                    entry.pattern
                )));
            }
            let glob = Glob::new(&entry.pattern).map_err(|e| ConfigError::Pattern {
                pattern: entry.pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ConfigError::Pattern {
            pattern: overrides
                .iter()
                .map(|o| o.pattern.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            message: e.to_string(),
        })?;

        Ok(Self {
            resolution: Resolution::Patterns {
                fallback,
                set,
                timeouts: overrides.iter().map(|o| o.timeout).collect(),
            },
        })
    }

    /// Arbitrary function of the test identifier.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        Self {
            resolution: Resolution::Custom(Arc::new(f)),
        }
    }

    /// Timeout for `test`.
    pub fn timeout_for(&self, test: &str) -> Duration {
        match &self.resolution {
            Resolution::Constant(timeout) => *timeout,
            Resolution::Patterns {
                fallback,
                set,
                timeouts,
            } => set
                .matches(test)
                .into_iter()
                .min()
                .and_then(|index| timeouts.get(index).copied())
                .unwrap_or(*fallback),
            Resolution::Custom(f) => f(test),
        }
    }
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resolution {
            Resolution::Constant(timeout) => f.debug_tuple("Constant").field(timeout).finish(),
            Resolution::Patterns {
                fallback, timeouts, ..
            } => f
                .debug_struct("Patterns")
                .field("fallback", fallback)
                .field("overrides", &timeouts.len())
                .finish(),
            Resolution::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides() -> Vec<TimeoutOverride> {
        vec![
            TimeoutOverride {
                pattern: "spec/slow/**".to_string(),
                timeout: Duration::from_secs(300),
            },
            TimeoutOverride {
                pattern: "spec/**/*_integration_spec.rb".to_string(),
                timeout: Duration::from_secs(120),
            },
        ]
    }

    #[test]
    fn test_constant() {
        let policy = TimeoutPolicy::constant(Duration::from_secs(60));
        assert_eq!(policy.timeout_for("anything"), Duration::from_secs(60));
    }

    #[test]
    fn test_first_matching_override_wins() {
        let policy = TimeoutPolicy::with_overrides(Duration::from_secs(60), &overrides()).unwrap();

        assert_eq!(
            policy.timeout_for("spec/slow/db_integration_spec.rb"),
            Duration::from_secs(300)
        );
        assert_eq!(
            policy.timeout_for("spec/api/db_integration_spec.rb"),
            Duration::from_secs(120)
        );
        assert_eq!(policy.timeout_for("spec/models/user_spec.rb"), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let bad = vec![TimeoutOverride {
            pattern: "spec/[".to_string(),
            timeout: Duration::from_secs(1),
        }];
        let result = TimeoutPolicy::with_overrides(Duration::from_secs(60), &bad);
        assert!(matches!(result, Err(ConfigError::Pattern { .. })));
    }

    #[test]
    fn test_zero_override_rejected() {
        let bad = vec![TimeoutOverride {
            pattern: "spec/**".to_string(),
            timeout: Duration::ZERO,
        }];
        let result = TimeoutPolicy::with_overrides(Duration::from_secs(60), &bad);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_fn() {
        let policy = TimeoutPolicy::from_fn(|test| {
            if test.contains("slow") {
                Duration::from_secs(10)
            } else {
                Duration::from_secs(1)
            }
        });
        assert_eq!(policy.timeout_for("a/slow_spec.rb"), Duration::from_secs(10));
        assert_eq!(policy.timeout_for("a/fast_spec.rb"), Duration::from_secs(1));
    }
}
