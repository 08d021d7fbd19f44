//! External command executor
//!
//! Runs every test through a command template taken from the run profile:
//!
//! ```toml
//! [profile]
//! command = ["bundle", "exec", "rspec", "{test}"]
//! working_dir = "."
//! [profile.env]
//! RAILS_ENV = "test"
//! ```
//!
//! `{test}` is replaced by the identifier; without a placeholder the
//! identifier is appended. The run seed is exported as `DISTRIB_SEED`.
//!
//! A command that reports an error while loading the test file, the way
//! RSpec prints `An error occurred while loading ./spec/a_spec.rb.`, produces
//! a failure outside of tests for the leader to act on.

use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Output};
use std::sync::OnceLock;
use std::time::Instant;

use distrib_protocol::ops::ProfileResponse;
use distrib_protocol::{FailureRecord, TestEvent, TestStatus};
use regex_lite::Regex;
use serde::Deserialize;

use crate::worker::{Execution, TestExecutor};

/// Placeholder replaced by the test identifier
pub const TEST_PLACEHOLDER: &str = "{test}";

/// Outer class of a failed command
pub const COMMAND_FAILED: &str = "CommandFailed";

/// Error lines on stderr, e.g. `Net::ReadTimeoutError: execution expired`
fn error_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Za-z0-9_:]*(?:Error|Exception)): (.*)$")
            .unwrap_or_else(|e| unreachable!("static pattern is valid: {}", e))
    })
}

/// `An error occurred while loading ./spec/a_spec.rb.`
fn loading_error_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^An error occurred while loading (\S+?)\.?$")
            .unwrap_or_else(|e| unreachable!("static pattern is valid: {}", e))
    })
}

#[derive(Debug, Deserialize)]
struct CommandProfile {
    command: Vec<String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
}

/// Runs each test as an external process
#[derive(Debug, Default)]
pub struct CommandExecutor {
    profile: Option<CommandProfile>,
    seed: u64,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn command_for(profile: &CommandProfile, test: &str, seed: u64) -> Command {
        let mut args: Vec<String> = profile
            .command
            .iter()
            .map(|arg| arg.replace(TEST_PLACEHOLDER, test))
            .collect();
        if !profile.command.iter().any(|arg| arg.contains(TEST_PLACEHOLDER)) {
            args.push(test.to_string());
        }

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        command.envs(&profile.env);
        command.env("DISTRIB_SEED", seed.to_string());
        if let Some(dir) = &profile.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl TestExecutor for CommandExecutor {
    fn prepare(&mut self, profile: &ProfileResponse) -> Result<(), FailureRecord> {
        let parsed: CommandProfile = serde_json::from_value(profile.profile.clone())
            .map_err(|e| FailureRecord::new("ConfigurationError", format!("invalid profile: {}", e)))?;

        if parsed.command.is_empty() {
            return Err(FailureRecord::new(
                "ConfigurationError",
                "profile.command must not be empty",
            ));
        }
        if let Some(dir) = &parsed.working_dir {
            if !dir.is_dir() {
                return Err(FailureRecord::new(
                    "ConfigurationError",
                    format!("working directory {} does not exist", dir.display()),
                ));
            }
        }

        self.profile = Some(parsed);
        self.seed = profile.seed;
        Ok(())
    }

    fn execute(&mut self, test: &str) -> Execution {
        let Some(profile) = &self.profile else {
            return Execution::crashed(FailureRecord::new("ConfigurationError", "executor not prepared"));
        };

        let started = Instant::now();
        let output = match Self::command_for(profile, test, self.seed).output() {
            Ok(output) => output,
            Err(e) => {
                return Execution::crashed(FailureRecord::new(
                    "SpawnError",
                    format!("failed to run {}: {}", profile.command[0], e),
                ));
            }
        };
        let elapsed = started.elapsed();

        let event = match output.status.code() {
            Some(0) => TestEvent::finished(TestStatus::Passed),
            _ => TestEvent::finished(TestStatus::Failed).with_failure(failure_of(&profile.command[0], &output)),
        };
        let event = event
            .with_metadata("test", test.into())
            .with_metadata("exit_code", output.status.code().into())
            .with_metadata("duration_ms", (elapsed.as_millis() as u64).into());

        let mut execution = Execution::new(vec![event]);
        if let Some(context) = loading_error(&output) {
            let exception = failure_of(&profile.command[0], &output);
            execution = execution.with_non_test_failure(exception, context);
        }
        execution
    }
}

/// Context of a load error printed by the command, if any
fn loading_error(output: &Output) -> Option<String> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .find_map(|line| loading_error_line().captures(line.trim()).map(|c| format!("loading {}", &c[1])))
}

/// Run the leader's `on_finish` command with the run's exit code exported as
/// `DISTRIB_EXIT_CODE`.
pub fn run_finish_command(argv: &[String], exit_code: i32) -> io::Result<ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "on_finish command is empty"));
    };
    Command::new(program)
        .args(args)
        .env("DISTRIB_EXIT_CODE", exit_code.to_string())
        .status()
}

/// Failure record for a non-zero exit, with error lines from stderr as causes
fn failure_of(program: &str, output: &Output) -> FailureRecord {
    let message = match output.status.code() {
        Some(code) => format!("{} exited with status {}", program, code),
        None => format!("{} was terminated by a signal", program),
    };
    let mut record = FailureRecord::new(COMMAND_FAILED, message);

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        if let Some(captures) = error_line().captures(line.trim()) {
            record = record.caused_by(&captures[1], &captures[2]);
        }
    }
    record
}
