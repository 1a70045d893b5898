//! handoff: operator CLI for the handoff monitor.
//!
//! Reads and adjusts the artifacts the daemon owns. Output goes to stdout as
//! JSON or markdown; diagnostics go to the rolling log under `~/.handoff/logs`.
//!
//! ## Subcommands
//!
//! - `status`: status artifact with routing, limit flag and latest snapshot
//! - `set-limit` / `simulate-reset`: drive the limit side channel by hand
//! - `resume`: write and print the resume directive
//! - `reset-warnings`: clear the usage warning markers
//! - `snapshot`: save the current work state now

mod commands;
mod logging;

use chrono::Utc;
use clap::{Parser, Subcommand};
use handoff_core::{load_config, MonitorConfig, StorageConfig};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(about = "Inspect and steer the handoff session monitor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current status as JSON
    Status,

    /// Mark the assistant's usage limit as reached
    SetLimit,

    /// Clear the limit flag and mark the session active
    SimulateReset,

    /// Write the resume directive from the latest snapshot and print it
    Resume,

    /// Remove the 75% and 90% usage warning markers
    ResetWarnings,

    /// Capture and save a work-state snapshot
    Snapshot,
}

fn main() {
    let cli = Cli::parse();

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("handoff: {}", err);
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(&storage);

    if let Err(err) = run(cli.command, &storage) {
        tracing::error!(error = %err, "handoff command failed");
        eprintln!("handoff: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Commands, storage: &StorageConfig) -> Result<(), String> {
    let now = Utc::now();
    match command {
        Commands::Status => print_json(&commands::status_report(storage)),
        Commands::SetLimit => print_json(&commands::set_limit(storage, now)?),
        Commands::SimulateReset => print_json(&commands::simulate_reset(storage, now)?),
        Commands::Resume => {
            let (path, directive) = commands::resume(storage)?;
            tracing::debug!(path = %path.display(), "Directive path");
            print!("{}", directive);
            Ok(())
        }
        Commands::ResetWarnings => {
            commands::reset_warnings(storage, &config(storage))?;
            println!("Warning markers cleared");
            Ok(())
        }
        Commands::Snapshot => {
            let config = config(storage);
            let source = commands::git_source(storage, &config);
            let path = commands::snapshot(storage, &source, now)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn config(storage: &StorageConfig) -> MonitorConfig {
    match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load monitor config; using defaults");
            MonitorConfig::default()
        }
    }
}

fn print_json(value: &Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{}", text);
    Ok(())
}
