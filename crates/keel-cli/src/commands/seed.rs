//! Seed command - Push and pull incremental state snapshots
//!
//! Usage:
//! ```bash
//! keel seed push
//! keel seed pull
//! keel seed status
//! ```

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use keel_persist::AgentHome;

use super::{check_runs, open_engine};
use crate::{print_info, print_success, print_warning};

/// Arguments for the seed command
#[derive(Args)]
pub struct SeedArgs {
    #[command(subcommand)]
    command: SeedCommand,
}

#[derive(Subcommand)]
pub enum SeedCommand {
    /// Sign, encrypt and publish a snapshot to every backend
    #[command(name = "push")]
    Push,

    /// Merge every new snapshot waiting in the inboxes
    #[command(name = "pull")]
    Pull,

    /// Show outbox, inbox, archive and device counts
    #[command(name = "status")]
    Status,
}

/// Run the seed command
pub async fn run(home: &AgentHome, args: SeedArgs) -> Result<()> {
    let engine = open_engine(home).await?;

    match args.command {
        SeedCommand::Push => {
            let runs = engine.push_seed().await?;
            for run in &runs {
                if let Ok(name) = &run.result {
                    print_success(&format!("{}: pushed {}", run.backend.cyan(), name));
                }
            }
            check_runs(&runs)
        }
        SeedCommand::Pull => {
            let runs = engine.pull_seeds().await?;
            for run in &runs {
                let Ok(report) = &run.result else { continue };
                if report.merged.is_empty() && report.rejected.is_empty() {
                    print_info(&format!("{}: nothing new", run.backend.cyan()));
                }
                for (name, outcome) in &report.merged {
                    if outcome.has_conflict() {
                        print_warning(&format!(
                            "{}: merged {} with conflicts (memory {:?}, trust {:?}, manifest {:?})",
                            run.backend, name, outcome.memory, outcome.trust, outcome.manifest
                        ));
                    } else {
                        print_success(&format!("{}: merged {}", run.backend.cyan(), name));
                    }
                }
                if !report.duplicates.is_empty() {
                    print_info(&format!(
                        "{}: skipped {} already merged",
                        run.backend.cyan(),
                        report.duplicates.len()
                    ));
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
        SeedCommand::Status => {
            let status = engine.status().await?;
            println!("{}", "🌱 Seed Status".bold().cyan());
            println!("{}", "═".repeat(50).cyan());
            println!("  {} {}", "Device:".dimmed(), status.agent.device_key().green());

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
                ]);
            let mut devices = None;
            for backend in &status.backends {
                match &backend.seeds {
                    Some(s) => {
                        table.add_row(vec![
                            Cell::new(&backend.name).fg(Color::Green),
                            Cell::new(s.outbox),
                            Cell::new(s.inbox),
                            Cell::new(s.archived),
                            Cell::new(s.rejected).fg(if s.rejected > 0 { Color::Red } else { Color::Reset }),
                        ]);
                        devices.get_or_insert_with(|| s.devices.clone());
                    }
                    None => {
                        table.add_row(vec![
                            Cell::new(&backend.name).fg(Color::Red),
                            Cell::new("unreachable"),
                            Cell::new("-"),
                            Cell::new("-"),
                            Cell::new("-"),
                        ]);
                    }
                }
            }
            println!("{table}");

            if let Some(devices) = devices.filter(|d| !d.is_empty()) {
                println!();
                println!("{}", "Last heard from:".bold());
                for (device, seen) in devices {
                    println!("  {} {}", device.green(), seen.to_rfc3339().dimmed());
                }
            }
            Ok(())
        }
    }
}
