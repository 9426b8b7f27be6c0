//! servtest - conformance and fault-injection harness for HTTP servers.
//!
//! ## Subcommands
//!
//! **`run`**: execute the scenario list against the configured server,
//! aborting on the first failure unless `--keep-going` is given.
//!
//! **`list`**: print the scenario names without running anything.
//!
//! **`analyze`**: run the instrumentation-log analyzer standalone over an
//! existing log file.

use clap::{Parser as ClapParser, Subcommand};
use servtest::config::{ConfigError, ScenarioConfig};
use servtest::scenario::{self, RunPolicy};
use servtest::valgrind;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// servtest - conformance and fault-injection harness for HTTP servers.
///
/// Drives an external HTTP server over raw TCP under a memory/descriptor
/// instrumentation tool, delivers signals at chosen points in the request
/// lifecycle, and judges correctness from the responses and the
/// instrumentation log.
#[derive(ClapParser, Debug)]
#[command(name = "servtest", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scenario list against the server under test
    Run {
        /// Path to the harness config file (TOML)
        #[arg(long, default_value = "servtest.toml")]
        config: PathBuf,

        /// Only run scenarios whose name contains this substring
        #[arg(long)]
        filter: Option<String>,

        /// Keep running after a scenario fails instead of aborting
        #[arg(long)]
        keep_going: bool,
    },

    /// List scenario names without running anything
    List,

    /// Analyze an existing instrumentation log for leaks
    Analyze {
        /// Path to the instrumentation log file
        log: PathBuf,

        /// Path to the harness config file (for marker overrides)
        #[arg(long, default_value = "servtest.toml")]
        config: PathBuf,
    },
}

#[derive(Error, Debug)]
enum HarnessError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} scenario(s) failed")]
    ScenariosFailed(usize),

    #[error("log reports leaks")]
    LogNotClean,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            filter,
            keep_going,
        } => run_scenarios(config, filter, keep_going),
        Commands::List => run_list(),
        Commands::Analyze { log, config } => run_analyze(log, config),
    };

    if let Err(e) = result {
        eprintln!("servtest: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "servtest=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &PathBuf) -> Result<ScenarioConfig, HarnessError> {
    match ScenarioConfig::load(path)? {
        Some(config) => {
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Ok(ScenarioConfig::default())
        }
    }
}

fn run_scenarios(
    config_path: PathBuf,
    filter: Option<String>,
    keep_going: bool,
) -> Result<(), HarnessError> {
    let config = load_config(&config_path)?;

    let mut scenarios = scenario::all_scenarios();
    if let Some(filter) = &filter {
        scenarios.retain(|s| s.name().contains(filter.as_str()));
    }
    if scenarios.is_empty() {
        eprintln!("servtest: no scenarios match the filter");
        return Ok(());
    }

    let policy = if keep_going {
        RunPolicy::KeepGoing
    } else {
        RunPolicy::AbortOnFailure
    };
    let results = scenario::run_all(&scenarios, &config, policy);

    let mut failed = 0;
    for result in &results {
        if result.passed {
            println!("PASS  {}", result.name);
        } else {
            failed += 1;
            println!("FAIL  {}", result.name);
            for line in &result.diagnostics {
                println!("      {line}");
            }
        }
    }
    let skipped = scenarios.len() - results.len();
    if skipped > 0 {
        println!("({skipped} scenario(s) skipped after abort)");
    }

    if failed > 0 {
        Err(HarnessError::ScenariosFailed(failed))
    } else {
        println!("All {} scenario(s) passed.", results.len());
        Ok(())
    }
}

fn run_list() -> Result<(), HarnessError> {
    for scenario in scenario::all_scenarios() {
        println!("{}", scenario.name());
    }
    Ok(())
}

fn run_analyze(log_path: PathBuf, config_path: PathBuf) -> Result<(), HarnessError> {
    let config = load_config(&config_path)?;
    let log = std::fs::read_to_string(&log_path)?;
    let analysis = valgrind::analyze(&log, &config.markers);

    for finding in analysis.descriptor_leaks() {
        println!("descriptor leak: {}", finding.raw);
    }
    for finding in analysis.memory_leaks() {
        println!("memory leak: {}", finding.raw);
    }
    let inherited = analysis
        .findings
        .iter()
        .filter(|f| f.inherited)
        .count();
    if inherited > 0 {
        println!("({inherited} open descriptor(s) inherited from parent, ignored)");
    }

    if analysis.is_clean() {
        println!("log is clean");
        Ok(())
    } else {
        Err(HarnessError::LogNotClean)
    }
}
