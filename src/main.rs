//! test-distrib CLI
//!
//! Entry point for the `test-distrib` command-line tool.

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use test_distrib::integration::{provider_for, run_finish_command, CommandExecutor, ConsoleReporter};
use test_distrib::worker::{Execution, Worker};
use test_distrib::{logging, signal, worker, DistribConfig, Leader, SignalState};

/// Config file used when `--config` is not given and the file exists
const DEFAULT_CONFIG_PATH: &str = "distrib.toml";

#[derive(Parser)]
#[command(name = "test-distrib")]
#[command(about = "Distribute a test suite across worker processes", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the test queue to workers and report the results
    Leader {
        /// Path to config file (default: distrib.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,

        /// Run seed handed to workers
        #[arg(long)]
        seed: Option<u64>,

        /// Print the run outcome as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Lease and run tests from a leader
    Worker {
        /// Path to config file (default: distrib.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Leader address
        #[arg(long)]
        leader: Option<String>,

        /// Connection attempts before giving up
        #[arg(long)]
        connection_attempts: Option<u32>,
    },

    /// Check the configuration and list the tests a leader would enqueue
    Verify {
        /// Path to config file (default: distrib.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Leader {
            config,
            listen,
            seed,
            json,
        } => {
            let mut overrides = Map::new();
            if let Some(listen) = listen {
                overrides.insert("listen_addr".to_string(), json!(listen));
            }
            if let Some(seed) = seed {
                overrides.insert("seed".to_string(), json!(seed));
            }
            run_leader(config, Value::Object(overrides), json);
        }
        Commands::Worker {
            config,
            leader,
            connection_attempts,
        } => {
            let mut overrides = Map::new();
            if let Some(leader) = leader {
                overrides.insert("leader_addr".to_string(), json!(leader));
            }
            if let Some(attempts) = connection_attempts {
                overrides.insert("leader_connection_attempts".to_string(), json!(attempts));
            }
            run_worker(config, Value::Object(overrides));
        }
        Commands::Verify { config } => {
            run_verify(config);
        }
    }
}

fn load_config(config_path: Option<PathBuf>, overrides: Value) -> DistribConfig {
    let path = config_path.or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_PATH);
        default.exists().then(|| default.to_path_buf())
    });

    match DistribConfig::load(path.as_deref(), Some(overrides)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    }
}

/// Console logging plus the configured debug log; console only when the
/// file cannot be opened
fn init_logging(config: &DistribConfig) {
    if let Err(e) = logging::init(config.debug_log_path()) {
        eprintln!("Failed to set up debug log: {}", e);
        if let Err(e) = logging::init(None) {
            eprintln!("Failed to install logger: {}", e);
        }
    }
}

fn install_signals() -> Arc<SignalState> {
    let signals = Arc::new(SignalState::new());
    if let Err(e) = signal::install(Arc::clone(&signals)) {
        eprintln!("Failed to install signal handlers: {}", e);
        process::exit(1);
    }
    signals
}

fn run_leader(config_path: Option<PathBuf>, overrides: Value, json_output: bool) {
    let config = load_config(config_path, overrides);
    init_logging(&config);
    let signals = install_signals();

    let tests = match provider_for(&config.tests).and_then(|provider| provider.tests()) {
        Ok(tests) => tests,
        Err(e) => {
            eprintln!("Error collecting tests: {}", e);
            process::exit(1);
        }
    };

    let finish_command = config.on_finish.clone();
    let mut leader = Leader::new(config, tests, Box::new(ConsoleReporter::stdout())).with_signals(signals);
    if !finish_command.is_empty() {
        leader = leader.on_finish(move |outcome| match run_finish_command(&finish_command, outcome.exit_code) {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(%status, "on_finish command failed"),
            Err(e) => tracing::warn!(error = %e, "failed to run on_finish command"),
        });
    }
    let outcome = match leader.run() {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Leader failed: {}", e);
            process::exit(1);
        }
    };

    if json_output {
        match serde_json::to_string_pretty(&outcome) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error serializing outcome: {}", e),
        }
    }

    process::exit(outcome.exit_code);
}

fn run_worker(config_path: Option<PathBuf>, overrides: Value) {
    let config = load_config(config_path, overrides);
    init_logging(&config);
    let signals = install_signals();

    let client = match worker::connect(&config, &signals) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Worker failed: {}", e);
            process::exit(signals.exit_code().unwrap_or(1));
        }
    };

    let outcome = Worker::new(client, CommandExecutor::new(), signals)
        .before_test_report(tag_worker)
        .run();
    process::exit(outcome.exit_code);
}

/// Record which worker process ran each event
fn tag_worker(_test: &str, execution: &mut Execution) {
    let pid = process::id();
    for event in &mut execution.events {
        event.metadata.insert("worker_pid".to_string(), json!(pid));
    }
}

fn run_verify(config_path: Option<PathBuf>) {
    let config = load_config(config_path, Value::Object(Map::new()));
    if let Err(e) = logging::init(None) {
        eprintln!("Failed to install logger: {}", e);
    }

    let tests = match provider_for(&config.tests).and_then(|provider| provider.tests()) {
        Ok(tests) => tests,
        Err(e) => {
            eprintln!("Error collecting tests: {}", e);
            process::exit(1);
        }
    };

    println!("Configuration valid");
    println!();
    println!("  Listen address: {}", config.listen_addr);
    println!("  Leader address: {}", config.leader_addr);
    println!("  Test timeout: {}s", config.test_timeout.as_secs_f64());
    println!("  Timeout strategy: {:?}", config.timeout_strategy);
    println!("  Retry policy: {:?} ({} attempts)", config.retry.policy, config.retry.retry_attempts);
    match config.debug_log_path() {
        Some(path) => println!("  Debug log: {}", path.display()),
        None => println!("  Debug log: disabled"),
    }
    println!("  Tests: {}", tests.len());
    for test in tests.iter().take(10) {
        println!("    {}", test);
    }
    if tests.len() > 10 {
        println!("    ... and {} more", tests.len() - 10);
    }
}
