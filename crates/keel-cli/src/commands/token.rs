//! Token command - Issue and check capability tokens
//!
//! Usage:
//! ```bash
//! keel token issue Jarvis memory:read memory:write --ttl 1h
//! keel token authorize 3f2a9c memory:read
//! keel token revoke 3f2a9c --reason "laptop lost"
//! keel token export 3f2a9c -o jarvis.token.json
//! keel token import jarvis.token.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use keel_core::{Capability, IssueOptions, SignedToken, TokenAuthority, TokenType};
use keel_persist::{open_authority, AgentHome};

use super::{load_keys, short};
use crate::{print_error, print_info, print_success};

/// Arguments for the token command
#[derive(Args)]
pub struct TokenArgs {
    #[command(subcommand)]
    command: TokenCommand,
}

#[derive(Subcommand)]
pub enum TokenCommand {
    /// Issue a signed token
    #[command(name = "issue")]
    Issue {
        /// Who the token is for
        subject: String,

        /// Capabilities to grant (e.g. memory:read, or * for all)
        #[arg(required = true)]
        capabilities: Vec<String>,

        /// Lifetime such as 90s, 30m, 1h, 7d (0 or absent: no expiry)
        #[arg(long)]
        ttl: Option<String>,

        /// agent, capability or delegation
        #[arg(long = "type", default_value = "capability")]
        token_type: String,

        /// Not valid before this RFC 3339 time
        #[arg(long, value_name = "TIME")]
        not_before: Option<String>,

        /// Extra metadata as key=value
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,

        /// Print the portable JSON instead of a summary
        #[arg(long)]
        export: bool,
    },

    /// Verify a token's signature, revocation and time window
    #[command(name = "verify")]
    Verify {
        /// Token id (or unique prefix) or exported token file
        token: String,
    },

    /// Check a token grants a capability right now
    #[command(name = "authorize")]
    Authorize {
        /// Token id (or unique prefix) or exported token file
        token: String,

        capability: String,
    },

    /// Revoke a token
    #[command(name = "revoke")]
    Revoke {
        /// Token id or unique prefix
        token: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// List issued and imported tokens
    #[command(name = "list")]
    List {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Export a token as portable JSON
    #[command(name = "export")]
    Export {
        /// Token id or unique prefix
        token: String,

        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Import an exported token after checking its signature
    #[command(name = "import")]
    Import {
        file: PathBuf,
    },
}

/// Run the token command
pub async fn run(home: &AgentHome, args: TokenArgs) -> Result<()> {
    let keys = Arc::new(load_keys(home).await?);
    let auth = open_authority(home, keys)
        .await
        .context("Failed to open token store")?;

    match args.command {
        TokenCommand::Issue {
            subject,
            capabilities,
            ttl,
            token_type,
            not_before,
            metadata,
            export,
        } => {
            let options = IssueOptions {
                token_type: token_type.parse::<TokenType>()?,
                ttl: ttl.as_deref().map(parse_ttl).transpose()?,
                not_before: not_before.as_deref().map(parse_time).transpose()?,
                metadata: parse_metadata(&metadata)?,
            };
            issue(&auth, &subject, &capabilities, options, export).await
        }
        TokenCommand::Verify { token } => verify(&auth, &token).await,
        TokenCommand::Authorize { token, capability } => authorize(&auth, &token, &capability).await,
        TokenCommand::Revoke { token, reason } => revoke(&auth, &token, reason).await,
        TokenCommand::List { json } => list(&auth, json).await,
        TokenCommand::Export { token, output } => export(&auth, &token, output).await,
        TokenCommand::Import { file } => import(&auth, &file).await,
    }
}

async fn issue(
    auth: &TokenAuthority,
    subject: &str,
    capabilities: &[String],
    options: IssueOptions,
    export: bool,
) -> Result<()> {
    let capabilities = capabilities
        .iter()
        .map(|c| c.parse::<Capability>())
        .collect::<Result<Vec<_>, _>>()?;
    let token = auth.issue(subject, capabilities, options).await?;

    if export {
        println!("{}", token.to_export_json()?);
        return Ok(());
    }

    print_success(&format!("Issued token to {}", subject.green()));
    print_token(&token);
    Ok(())
}

async fn verify(auth: &TokenAuthority, arg: &str) -> Result<()> {
    let token = load_token(auth, arg).await?;
    let verdict = auth.verdict(&token, Utc::now()).await?;

    if verdict.valid {
        print_success(&format!("Token {} is valid", short(&verdict.token_id)));
        print_token(&token);
        Ok(())
    } else {
        let reason = verdict.reason.map(|r| r.to_string()).unwrap_or_default();
        print_error(&format!(
            "Token {} is not valid: {}",
            short(&verdict.token_id),
            reason.red()
        ));
        if let Some(detail) = verdict.detail {
            println!("  {} {}", "Detail:".dimmed(), detail);
        }
        bail!("verification failed: {reason}")
    }
}

async fn authorize(auth: &TokenAuthority, arg: &str, capability: &str) -> Result<()> {
    let token = load_token(auth, arg).await?;
    let capability: Capability = capability.parse()?;

    match auth.authorize(&token, capability, Utc::now()).await {
        Ok(()) => {
            print_success(&format!(
                "{} may {}",
                token.payload.subject.green(),
                capability.to_string().cyan()
            ));
            Ok(())
        }
        Err(e) => {
            let kind = e.kind().map(|k| k.to_string()).unwrap_or_else(|| "error".into());
            print_error(&format!("Denied ({}): {}", kind.red(), e));
            Err(anyhow!(e))
        }
    }
}

async fn revoke(auth: &TokenAuthority, arg: &str, reason: Option<String>) -> Result<()> {
    let id = auth.resolve(arg).await?;
    if auth.revoke(&id, reason).await? {
        print_success(&format!("Revoked {}", short(&id)));
    } else {
        print_info(&format!("{} was already revoked", short(&id)));
    }
    Ok(())
}

async fn list(auth: &TokenAuthority, json: bool) -> Result<()> {
    let tokens = auth.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tokens)?);
        return Ok(());
    }
    if tokens.is_empty() {
        print_info("No tokens yet");
        return Ok(());
    }

    let now = Utc::now();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Subject").fg(Color::Cyan),
            Cell::new("Capabilities").fg(Color::Cyan),
            Cell::new("Expires").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
        ]);

    for token in &tokens {
        let verdict = auth.verdict(token, now).await?;
        let status = match verdict.reason {
            None => Cell::new("valid").fg(Color::Green),
            Some(kind) => Cell::new(kind.to_string()).fg(Color::Red),
        };
        let caps: Vec<&str> = token.payload.capabilities.iter().map(|c| c.as_str()).collect();
        let expires = token
            .payload
            .expires_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string());

        table.add_row(vec![
            Cell::new(short(token.token_id())),
            Cell::new(&token.payload.subject).fg(Color::Green),
            Cell::new(caps.join(", ")).fg(Color::Yellow),
            Cell::new(expires),
            status,
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn export(auth: &TokenAuthority, arg: &str, output: Option<PathBuf>) -> Result<()> {
    let id = auth.resolve(arg).await?;
    let json = auth.export(&id).await?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, format!("{json}\n"))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            print_success(&format!("Exported {} to {}", short(&id), path.display()));
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn import(auth: &TokenAuthority, file: &Path) -> Result<()> {
    let json = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let token = auth.import(&json).await.context("Token rejected")?;
    print_success(&format!("Imported token {}", short(token.token_id())));
    print_token(&token);
    Ok(())
}

/// An exported token file, or an id prefix from the local store
async fn load_token(auth: &TokenAuthority, arg: &str) -> Result<SignedToken> {
    let path = Path::new(arg);
    if path.is_file() {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(SignedToken::from_export_json(&json)?);
    }
    let id = auth.resolve(arg).await?;
    Ok(auth.get(&id).await?)
}

fn print_token(token: &SignedToken) {
    let p = &token.payload;
    let caps: Vec<&str> = p.capabilities.iter().map(|c| c.as_str()).collect();
    println!("  {} {}", "Id:".dimmed(), p.token_id.cyan());
    println!("  {} {}", "Type:".dimmed(), p.token_type);
    println!("  {} {}", "Issuer:".dimmed(), p.issuer);
    println!("  {} {}", "Subject:".dimmed(), p.subject.green());
    println!("  {} {}", "Capabilities:".dimmed(), caps.join(", ").yellow());
    println!("  {} {}", "Issued:".dimmed(), p.issued_at.to_rfc3339());
    if let Some(nb) = p.not_before {
        println!("  {} {}", "Not before:".dimmed(), nb.to_rfc3339());
    }
    match p.expires_at {
        Some(exp) => println!("  {} {}", "Expires:".dimmed(), exp.to_rfc3339()),
        None => println!("  {} {}", "Expires:".dimmed(), "never".dimmed()),
    }
}

/// `90s`, `30m`, `1h`, `7d`, or a bare number of seconds
pub fn parse_ttl(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => s.split_at(i),
        None => (s, "s"),
    };
    let n: i64 = digits
        .parse()
        .with_context(|| format!("Invalid ttl '{s}'"))?;
    let ttl = match unit {
        "s" => Duration::try_seconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        other => bail!("Unknown ttl unit '{other}' (use s, m, h or d)"),
    };
    ttl.ok_or_else(|| anyhow!("ttl '{s}' is out of range"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid RFC 3339 time '{s}'"))?
        .with_timezone(&Utc))
}

fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Metadata must be KEY=VALUE, got '{pair}'"))?;
            let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
            Ok((k.to_string(), value))
        })
        .collect()
}
