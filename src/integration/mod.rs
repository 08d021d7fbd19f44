//! Adapters plugging concrete tools into the leader and worker

pub mod command;
pub mod console;
pub mod provider;

pub use command::{run_finish_command, CommandExecutor};
pub use console::ConsoleReporter;
pub use provider::{provider_for, GlobTestProvider, ProviderError, StaticTestProvider, TestProvider};
