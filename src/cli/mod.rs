//! CLI commands for agentmesh using clap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agents::OutboundReply;
use crate::config::{get_settings_path, load_settings, load_settings_or_default, save_settings, Settings};
use crate::coordinator::Coordinator;
use crate::hub::IngestReply;
use crate::providers::check_provider;
use crate::storage::{open_storage, user_statuses};

/// Sender used for stdin lines without a `user:` prefix.
const DEFAULT_USER: &str = "cli";

/// agentmesh - agent coordination layer with prioritized routing and dual-worker ingestion.
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version)]
#[command(about = "Route prioritized messages between LLM-backed agents", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest `user: message` lines from stdin and print replies
    Run,

    /// Send a single message and wait for the reply
    Send {
        /// Sending user
        #[arg(long, short)]
        user: String,

        /// Message to send
        message: String,

        /// Seconds to wait for a queued message's reply
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Manage per-user agents
    #[command(subcommand)]
    User(UserCommand),

    /// Show agents, users and queue state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show or create settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum UserCommand {
    /// Register a user
    Add { user_id: String },

    /// Mark a user inactive and remove their agent
    Remove { user_id: String },

    /// List known users and their status
    List,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings
    Show,

    /// Write default settings to ~/.agentmesh/settings.json
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Run => cmd_run().await,
            Command::Send { user, message, wait } => cmd_send(user, message, *wait).await,
            Command::User(cmd) => cmd_user(cmd).await,
            Command::Status { json } => cmd_status(*json).await,
            Command::Config(cmd) => cmd_config(cmd).await,
        }
    }
}

async fn start_coordinator() -> Result<Arc<Coordinator>> {
    let settings = load_settings()?;
    let coordinator = Arc::new(Coordinator::from_settings(settings)?);
    coordinator.initialize().await?;

    let restored = coordinator.restore_users().await?;
    if restored > 0 {
        tracing::info!("Restored {} active user(s)", restored);
    }
    Ok(coordinator)
}

/// Split `user: message`; lines without a prefix come from the default user.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match line.split_once(':') {
        Some((user, message)) if !user.trim().is_empty() && !user.contains(char::is_whitespace) => {
            Some((user.trim(), message.trim()))
        }
        _ => Some((DEFAULT_USER, line)),
    }
}

fn print_reply(reply: &OutboundReply) {
    println!("[{}] @{}: {}", reply.priority.label(), reply.user_id, reply.text);
}

fn print_ingest(reply: &IngestReply) {
    match reply {
        IngestReply::Processed { message_id, analysis, worker } => {
            tracing::debug!(
                "{} handled by {} as {}/{} ({:.2})",
                message_id,
                worker,
                analysis.intent,
                analysis.urgency,
                analysis.confidence
            );
        }
        IngestReply::Queued { message_id, priority, ack } => {
            println!("{} ({}, queued at {})", ack, message_id, priority);
        }
    }
}

// Command implementations

async fn cmd_run() -> Result<()> {
    let coordinator = start_coordinator().await?;
    if !check_provider(&coordinator.settings().provider).await? {
        println!("Warning: provider unreachable, classification will fail until it is back.");
    }
    println!("agentmesh running. Type `user: message`, Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reply = coordinator.next_reply() => match reply {
                Some(reply) => print_reply(&reply),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some((user, message)) = parse_line(&line) {
                        let reply = coordinator.ingest(user, message).await;
                        print_ingest(&reply);
                    }
                }
                None => break,
            },
        }
    }

    // Print what arrived while stdin was closing.
    for reply in coordinator.take_replies().await {
        print_reply(&reply);
    }
    coordinator.shutdown().await;
    Ok(())
}

async fn cmd_send(user: &str, message: &str, wait: u64) -> Result<()> {
    let coordinator = start_coordinator().await?;

    let reply = coordinator.ingest(user, message).await;
    print_ingest(&reply);

    match tokio::time::timeout(Duration::from_secs(wait), coordinator.next_reply()).await {
        Ok(Some(reply)) => print_reply(&reply),
        Ok(None) => println!("No reply"),
        Err(_) => println!("No reply within {}s", wait),
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn cmd_user(cmd: &UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add { user_id } => {
            let coordinator = start_coordinator().await?;
            let result = coordinator.add_user(user_id).await;
            coordinator.shutdown().await;
            result?;
            println!("Added user {}", user_id);
        }
        UserCommand::Remove { user_id } => {
            let coordinator = start_coordinator().await?;
            let result = coordinator.remove_user(user_id).await;
            coordinator.shutdown().await;
            result?;
            println!("Removed user {}", user_id);
        }
        UserCommand::List => {
            let settings = load_settings()?;
            let storage = open_storage(&settings.storage)?;
            let users = user_statuses(storage.as_ref()).await?;
            if users.is_empty() {
                println!("No users");
            }
            for (user_id, status) in users {
                println!("  {} | {}", user_id, status);
            }
        }
    }
    Ok(())
}

async fn cmd_status(json: bool) -> Result<()> {
    let coordinator = start_coordinator().await?;
    let status = coordinator.status();
    let users = user_statuses(coordinator.storage().as_ref()).await?;
    let reachable = check_provider(&coordinator.settings().provider).await?;
    coordinator.shutdown().await;

    if json {
        let out = serde_json::json!({
            "coordinator": status,
            "users": users,
            "providerReachable": reachable,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let reachability = if reachable { "reachable" } else { "unreachable" };
    println!("Provider: {} ({})", coordinator.settings().provider.name, reachability);
    println!("\nAgents:");
    for agent in &status.statuses {
        let health = if agent.healthy { "ok" } else { "unhealthy" };
        println!(
            "  @{} | {} | handled={} | {}",
            agent.agent_id, health, agent.handled, agent.detail
        );
    }

    println!("\nWorkers:");
    for worker in &status.hub.workers {
        println!(
            "  {} | busy={} pending={} processed={} failed={}",
            worker.id, worker.busy, worker.pending, worker.processed, worker.failed
        );
    }

    println!("\n{}", status.queue);

    println!("\nUsers:");
    if users.is_empty() {
        println!("  (none)");
    }
    for (user_id, user_status) in users {
        println!("  {} | {}", user_id, user_status);
    }
    Ok(())
}

async fn cmd_config(cmd: &ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let settings = load_settings_or_default();
            let mut shown = serde_json::to_value(&settings)?;
            if let Some(key) = shown.pointer_mut("/provider/api_key") {
                if !key.is_null() {
                    *key = serde_json::Value::String("********".to_string());
                }
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfigCommand::Init { force } => {
            let path = get_settings_path()?;
            if path.exists() && !force {
                println!("Settings already exist at {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            let path = save_settings(&Settings::default())?;
            println!("Wrote default settings to {}", path.display());
        }
    }
    Ok(())
}
