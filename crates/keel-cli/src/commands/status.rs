//! Status command - Trust lifecycle and sync health
//!
//! Usage:
//! ```bash
//! keel status
//! keel status --json
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use keel_core::{ArtifactHealth, TrustLifecycle};
use keel_persist::{probe, AgentHome};
use keel_sync::SyncEngine;

use crate::print_warning;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Run the status command
pub async fn run(home: &AgentHome, args: StatusArgs) -> Result<()> {
    let report = probe(home).await.context("Failed to inspect agent home")?;
    let lifecycle = report.derive();

    let sync = if lifecycle == TrustLifecycle::NoIdentity {
        None
    } else {
        match SyncEngine::open(home.clone()).await {
            Ok(engine) => Some(engine.status().await?),
            Err(e) => {
                print_warning(&format!("Sync unavailable: {e}"));
                None
            }
        }
    };

    if args.json {
        let out = serde_json::json!({
            "home": home.root(),
            "lifecycle": lifecycle,
            "artifacts": report,
            "sync": sync,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "⚓ Keel Status".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!("  {} {}", "Home:".dimmed(), home.root().display());
    let label = match lifecycle {
        TrustLifecycle::NoIdentity => lifecycle.to_string().red(),
        TrustLifecycle::PartialSetup => lifecycle.to_string().yellow(),
        TrustLifecycle::Operational | TrustLifecycle::VerifiedBond => lifecycle.to_string().green(),
    };
    println!("  {} {}", "Lifecycle:".dimmed(), label.bold());
    println!();

    println!("{}", "Artifacts:".bold());
    for (name, health) in [
        ("identity", &report.identity),
        ("memory", &report.memory),
        ("trust", &report.trust),
        ("bond", &report.bond),
    ] {
        let state = match health {
            ArtifactHealth::Valid => "valid".green(),
            ArtifactHealth::Missing => "missing".dimmed(),
            ArtifactHealth::Invalid(detail) => format!("invalid: {detail}").red(),
        };
        println!("  {:<10} {}", name, state);
    }

    if let Some(sync) = sync {
        println!();
        println!("{}", "Sync:".bold());
        println!("  {} {}", "Device:".dimmed(), sync.agent.device_key().green());
        println!("  {} {}", "Fingerprint:".dimmed(), sync.fingerprint.cyan());
        let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
        };
        println!("  {} {}", "Last push:".dimmed(), when(sync.state.last_push));
        println!("  {} {}", "Last pull:".dimmed(), when(sync.state.last_pull));
        for backend in &sync.backends {
            let health = if backend.healthy { "healthy".green() } else { "unreachable".red() };
            println!("  {:<10} {}", backend.name, health);
        }
        if let Some(err) = &sync.state.last_error {
            println!("  {} {}", "Last error:".dimmed(), err.yellow());
        }
    }
    Ok(())
}
