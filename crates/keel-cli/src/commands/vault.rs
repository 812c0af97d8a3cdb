//! Vault command - Full encrypted backups and restore
//!
//! Usage:
//! ```bash
//! keel vault push
//! keel vault pull
//! keel vault list
//! keel vault add-backend local --shared /mnt/usb/keel
//! keel vault add-backend git --repo ~/keel-sync --remote origin
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use keel_persist::AgentHome;
use keel_sync::{BackendConfig, BackendKind, SyncEngine};

use super::{check_runs, open_engine};
use crate::{print_info, print_success, print_warning};

/// Arguments for the vault command
#[derive(Args)]
pub struct VaultArgs {
    #[command(subcommand)]
    command: VaultCommand,
}

#[derive(Subcommand)]
pub enum VaultCommand {
    /// Pack, encrypt and publish a full backup
    #[command(name = "push")]
    Push,

    /// Restore the newest backup waiting in the inboxes
    #[command(name = "pull")]
    Pull,

    /// Show vault counts per backend
    #[command(name = "status")]
    Status,

    /// List vaults in the outbox, inbox and archive
    #[command(name = "list")]
    List,

    /// Configure a sync backend
    #[command(name = "add-backend")]
    AddBackend {
        /// local or git
        kind: String,

        /// Staging directory (default: sync/<kind> under the agent home)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,

        /// Shared folder to exchange blobs through (local)
        #[arg(long, value_name = "DIR")]
        shared: Option<PathBuf>,

        /// Working copy of the sync repository (git)
        #[arg(long, value_name = "DIR")]
        repo: Option<PathBuf>,

        /// Branch to commit to (git, default keel-sync)
        #[arg(long)]
        branch: Option<String>,

        /// Remote to push to and pull from (git)
        #[arg(long)]
        remote: Option<String>,

        /// Save the backend but leave it switched off
        #[arg(long)]
        disabled: bool,
    },
}

/// Run the vault command
pub async fn run(home: &AgentHome, args: VaultArgs) -> Result<()> {
    match args.command {
        VaultCommand::AddBackend {
            kind,
            path,
            shared,
            repo,
            branch,
            remote,
            disabled,
        } => {
            let backend = BackendConfig {
                kind: kind.parse::<BackendKind>()?,
                enabled: !disabled,
                path,
                shared,
                repo,
                branch,
                remote,
            };
            let config = SyncEngine::add_backend(home, backend).await?;
            print_success(&format!("Configured {} backend", kind.green()));
            for b in &config.backends {
                let state = if b.enabled { "enabled".green() } else { "disabled".yellow() };
                println!("  {} {}", b.kind.as_str().cyan(), state);
            }
            Ok(())
        }
        VaultCommand::Push => {
            let engine = open_engine(home).await?;
            let runs = engine.push_vault().await?;
            for run in &runs {
                if let Ok(name) = &run.result {
                    print_success(&format!("{}: pushed {}", run.backend.cyan(), name));
                }
            }
            check_runs(&runs)
        }
        VaultCommand::Pull => {
            let engine = open_engine(home).await?;
            let runs = engine.pull_vault().await?;
            for run in &runs {
                let Ok(report) = &run.result else { continue };
                match &report.restored {
                    Some((name, restored)) => print_success(&format!(
                        "{}: restored {} ({} files: {})",
                        run.backend.cyan(),
                        name,
                        restored.files,
                        restored.components.join(", ")
                    )),
                    None => print_info(&format!("{}: no vault to restore", run.backend.cyan())),
                }
                for name in &report.superseded {
                    print_info(&format!("{}: archived older {}", run.backend, name));
                }
                for rejected in &report.rejected {
                    print_warning(&format!(
                        "{}: quarantined {} ({})",
                        run.backend,
                        rejected.name,
                        rejected.kind.to_string().red()
                    ));
                }
            }
            check_runs(&runs)
        }
        VaultCommand::Status => {
            let engine = open_engine(home).await?;
            let status = engine.status().await?;
            println!("{}", "🔐 Vault Status".bold().cyan());
            println!("{}", "═".repeat(50).cyan());

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Backend").fg(Color::Cyan),
                    Cell::new("Outbox").fg(Color::Cyan),
                    Cell::new("Inbox").fg(Color::Cyan),
                    Cell::new("Archived").fg(Color::Cyan),
                    Cell::new("Rejected").fg(Color::Cyan),
                    Cell::new("Latest").fg(Color::Cyan),
                ]);
            for backend in &status.backends {
                match &backend.vaults {
                    Some(v) => table.add_row(vec![
                        Cell::new(&backend.name).fg(Color::Green),
                        Cell::new(v.outbox),
                        Cell::new(v.inbox),
                        Cell::new(v.archived),
                        Cell::new(v.rejected),
                        Cell::new(v.latest.as_deref().unwrap_or("-")),
                    ]),
                    None => table.add_row(vec![
                        Cell::new(&backend.name).fg(Color::Red),
                        Cell::new("unreachable"),
                        Cell::new("-"),
                        Cell::new("-"),
                        Cell::new("-"),
                        Cell::new("-"),
                    ]),
                };
            }
            println!("{table}");
            Ok(())
        }
        VaultCommand::List => {
            let engine = open_engine(home).await?;
            let runs = engine.list_vaults().await?;

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Backend").fg(Color::Cyan),
                    Cell::new("Where").fg(Color::Cyan),
                    Cell::new("Vault").fg(Color::Cyan),
                ]);
            let mut count = 0;
            for run in &runs {
                let Ok(listings) = &run.result else { continue };
                for listing in listings {
                    table.add_row(vec![
                        Cell::new(&run.backend).fg(Color::Green),
                        Cell::new(listing.namespace.as_str()),
                        Cell::new(&listing.name),
                    ]);
                    count += 1;
                }
            }
            if count == 0 {
                print_info("No vaults yet. Create one with `keel vault push`.");
            } else {
                println!("{table}");
            }
            check_runs(&runs)
        }
    }
}
