//! Keel CLI - identity, capability tokens and encrypted sync for personal agents
//!
//! # Usage
//!
//! ```bash
//! # Create the agent identity
//! keel identity init Opus
//!
//! # Issue a one-hour token to a sub-agent
//! keel token issue Jarvis memory:read memory:write --ttl 1h
//!
//! # Check it
//! keel token authorize 3f2a memory:read
//!
//! # Replicate state to paired devices
//! keel seed push
//! keel seed pull
//!
//! # Where does this agent stand
//! keel status
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use keel_persist::AgentHome;

mod commands;

use commands::{identity, seed, status, token, vault};

/// Keel - trust and replication substrate for personal agents
///
/// Every token is signed, every replicated byte is encrypted for the
/// agent's paired devices.
#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Keel CLI - agent identity, capability tokens and encrypted sync",
    long_about = "Keel gives a personal agent a signing identity, scoped capability\n\
                  tokens for the sub-agents it delegates to, and end-to-end encrypted\n\
                  replication of its state across devices."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Agent home directory (default: ~/.keel)
    #[arg(long, global = true, env = "KEEL_HOME", value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent identity and paired peers
    #[command(name = "identity")]
    Identity(identity::IdentityArgs),

    /// Issue, verify and revoke capability tokens
    #[command(name = "token")]
    Token(token::TokenArgs),

    /// Incremental state replication
    #[command(name = "seed")]
    Seed(seed::SeedArgs),

    /// Full encrypted backups
    #[command(name = "vault")]
    Vault(vault::VaultArgs),

    /// Show the trust lifecycle and sync health
    #[command(name = "status")]
    Status(status::StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    setup_logging(cli.verbose);

    let home = resolve_home(cli.home)?;

    match cli.command {
        Commands::Identity(args) => identity::run(&home, args).await,
        Commands::Token(args) => token::run(&home, args).await,
        Commands::Seed(args) => seed::run(&home, args).await,
        Commands::Vault(args) => vault::run(&home, args).await,
        Commands::Status(args) => status::run(&home, args).await,
    }
}

fn resolve_home(flag: Option<PathBuf>) -> Result<AgentHome> {
    let root = match flag {
        Some(path) => path,
        None => dirs::home_dir()
            .context("Could not determine the home directory; pass --home")?
            .join(".keel"),
    };
    Ok(AgentHome::new(root))
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_home_flag_wins() {
        let home = resolve_home(Some(PathBuf::from("/tmp/agent"))).unwrap();
        assert_eq!(home.root(), std::path::Path::new("/tmp/agent"));
    }
}
