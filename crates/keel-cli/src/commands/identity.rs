//! Identity command - Create, inspect and rotate the agent identity
//!
//! Usage:
//! ```bash
//! keel identity init Opus
//! keel identity show
//! keel identity export > opus.pub.json
//! keel identity add-peer desktop.pub.json
//! keel identity rotate
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use keel_core::PublicIdentity;
use keel_persist::{AgentHome, FileKeyStore};

use super::load_keys;
use crate::{print_info, print_success, print_warning};

/// Arguments for the identity command
#[derive(Args)]
pub struct IdentityArgs {
    #[command(subcommand)]
    command: IdentityCommand,
}

#[derive(Subcommand)]
pub enum IdentityCommand {
    /// Generate a new signing and encryption keypair
    #[command(name = "init")]
    Init {
        /// Agent name
        name: String,
    },

    /// Show the identity and paired peers
    #[command(name = "show")]
    Show {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Replace the keypair, keeping the old public key as a retired peer
    #[command(name = "rotate")]
    Rotate,

    /// Pair with another device or agent from its exported identity
    #[command(name = "add-peer")]
    AddPeer {
        /// Exported public identity JSON
        file: PathBuf,
    },

    /// Print the public identity for pairing
    #[command(name = "export")]
    Export {
        /// Write to a file instead of stdout
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

/// Run the identity command
pub async fn run(home: &AgentHome, args: IdentityArgs) -> Result<()> {
    match args.command {
        IdentityCommand::Init { name } => init(home, &name).await,
        IdentityCommand::Show { json } => show(home, json).await,
        IdentityCommand::Rotate => rotate(home).await,
        IdentityCommand::AddPeer { file } => add_peer(home, &file).await,
        IdentityCommand::Export { output } => export(home, output).await,
    }
}

async fn init(home: &AgentHome, name: &str) -> Result<()> {
    let keys = FileKeyStore::new(home.clone())
        .create(name, Utc::now())
        .await
        .with_context(|| format!("Failed to create identity in {}", home.root().display()))?;

    print_success(&format!("Created identity for {}", name.green()));
    println!("  {} {}", "Fingerprint:".dimmed(), keys.fingerprint().cyan());
    println!("  {} {}", "Home:".dimmed(), home.root().display());
    println!();
    print_info("Share it with `keel identity export` and pair with `keel identity add-peer`.");
    Ok(())
}

async fn show(home: &AgentHome, json: bool) -> Result<()> {
    let keys = load_keys(home).await?;
    let identity = keys.identity();

    if json {
        println!("{}", serde_json::to_string_pretty(identity)?);
        return Ok(());
    }

    println!("{}", "🔑 Agent Identity".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!("  {} {}", "Name:".dimmed(), identity.name.green());
    println!("  {} {}", "Fingerprint:".dimmed(), identity.fingerprint.cyan());
    println!("  {} {}", "Signing key:".dimmed(), identity.signing_key);
    println!("  {} {}", "Encryption key:".dimmed(), identity.encryption_key);
    println!("  {} {}", "Created:".dimmed(), identity.created_at.to_rfc3339());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Peer").fg(Color::Cyan),
            Cell::new("Fingerprint").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
        ]);
    let mut count = 0;
    for peer in keys.peers() {
        let status = if keys.is_retired(&peer.fingerprint) {
            Cell::new("retired").fg(Color::Yellow)
        } else {
            Cell::new("paired").fg(Color::Green)
        };
        table.add_row(vec![Cell::new(&peer.name), Cell::new(&peer.fingerprint), status]);
        count += 1;
    }

    if count == 0 {
        print_info("No paired peers yet");
    } else {
        println!("{table}");
    }
    Ok(())
}

async fn rotate(home: &AgentHome) -> Result<()> {
    let mut keys = load_keys(home).await?;
    let record = FileKeyStore::new(home.clone())
        .rotate(&mut keys, Utc::now())
        .await
        .context("Key rotation failed")?;

    print_success("Rotated identity keys");
    println!("  {} {}", "Old:".dimmed(), record.old_fingerprint.yellow());
    println!("  {} {}", "New:".dimmed(), record.new_fingerprint.green());
    print_warning("Re-export the identity and re-pair your other devices.");
    Ok(())
}

async fn add_peer(home: &AgentHome, file: &Path) -> Result<()> {
    let mut keys = load_keys(home).await?;
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let peer: PublicIdentity =
        serde_json::from_str(&content).with_context(|| "Failed to parse public identity JSON")?;

    let is_new = FileKeyStore::new(home.clone())
        .add_peer(&mut keys, peer.clone())
        .await
        .context("Peer key rejected")?;

    if is_new {
        print_success(&format!("Paired with {} ({})", peer.name.green(), peer.fingerprint));
    } else {
        print_info(&format!("Updated peer {} ({})", peer.name, peer.fingerprint));
    }
    Ok(())
}

async fn export(home: &AgentHome, output: Option<PathBuf>) -> Result<()> {
    let keys = load_keys(home).await?;
    let json = serde_json::to_string_pretty(keys.identity())?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, format!("{json}\n"))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            print_success(&format!("Wrote public identity to {}", path.display()));
        }
        None => println!("{json}"),
    }
    Ok(())
}
