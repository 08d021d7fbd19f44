//! Operation-specific types.
//!
//! The leader exposes a closed set of operations; anything else fails to
//! deserialize and is rejected before dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod profile;
pub mod report;

pub use next_test::{NextTestRequest, NextTestResponse};
pub use profile::{ProfileRequest, ProfileResponse};
pub use report::{ConfigurationErrorRequest, NonTestFailureRequest, ReportTestRequest, ReportTestResponse};

/// Operations exposed by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Lease the next test identifier (blocks until one is available)
    NextTestToRun,
    /// Report the event batch of one executed test
    ReportTest,
    /// Report a failure that happened before any test was leased
    ReportWorkerConfigurationError,
    /// Report a failure raised outside any test, e.g. while loading a file
    NotifyNonTestFailure,
    /// Fetch the opaque worker profile and run seed
    Profile,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::NextTestToRun => "next_test_to_run",
            Operation::ReportTest => "report_test",
            Operation::ReportWorkerConfigurationError => "report_worker_configuration_error",
            Operation::NotifyNonTestFailure => "notify_non_test_failure",
            Operation::Profile => "profile",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_match_serde() {
        for op in [
            Operation::NextTestToRun,
            Operation::ReportTest,
            Operation::ReportWorkerConfigurationError,
            Operation::NotifyNonTestFailure,
            Operation::Profile,
        ] {
            let json = serde_json::to_value(op).unwrap();
            assert_eq!(json, serde_json::Value::String(op.as_str().to_string()));
        }
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let result: Result<Operation, _> = serde_json::from_str("\"instance_eval\"");
        assert!(result.is_err());
    }
}
