//! agentmesh - routes prioritized messages between LLM-backed agents.

use clap::Parser;
use std::process::ExitCode;

use agentmesh::cli::Commands;
use agentmesh::config::load_settings;
use agentmesh::logging;

#[tokio::main]
async fn main() -> ExitCode {
    // Settings may not exist yet (`config init`); log with defaults then.
    let log_config = load_settings().map(|s| s.logging).unwrap_or_default();

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = match logging::init(&log_config) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
