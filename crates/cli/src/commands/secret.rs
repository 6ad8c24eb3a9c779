//! `warden secret`: Manage vault secrets.
//!
//! Goes through the same gateway path as the HTTP API, so key names are
//! validated and every call lands in the audit log. The vault and audit log
//! are locked by whoever opens them first; while `warden serve` runs, use the
//! `/v1/secrets` endpoints instead.

use anyhow::Context;
use clap::Subcommand;
use std::io::BufRead;
use warden_config::AppConfig;
use warden_core::CallerContext;
use warden_gateway::Gateway;
use warden_security::SecretMetadata;

#[derive(Subcommand)]
pub enum SecretCommand {
    /// Store a new secret. Reads the value from stdin when omitted.
    Add { key: String, value: Option<String> },

    /// Print a secret's value
    Get { key: String },

    /// Replace a secret's value. Reads the value from stdin when omitted.
    Rotate { key: String, value: Option<String> },

    /// Remove a secret
    Delete { key: String },

    /// List secret names and metadata (never values)
    List,
}

pub fn run(config: &AppConfig, action: SecretCommand) -> anyhow::Result<bool> {
    let gateway = Gateway::from_config(config)?;
    let ctx = CallerContext::new(cli_actor());

    match action {
        SecretCommand::Add { key, value } => {
            let value = value_or_stdin(value)?;
            gateway.secret_add(&ctx, &key, &value)?;
            println!("✅ Added {key}");
        }
        SecretCommand::Get { key } => {
            println!("{}", gateway.secret_get(&ctx, &key)?);
        }
        SecretCommand::Rotate { key, value } => {
            let value = value_or_stdin(value)?;
            gateway.secret_rotate(&ctx, &key, &value)?;
            println!("✅ Rotated {key}");
        }
        SecretCommand::Delete { key } => {
            gateway.secret_delete(&ctx, &key)?;
            println!("✅ Deleted {key}");
        }
        SecretCommand::List => {
            let secrets = gateway.secret_list(&ctx)?;
            if secrets.is_empty() {
                println!("No secrets stored.");
            } else {
                println!("{:<32} {:<20} {:<20} {:>8}", "KEY", "CREATED", "ROTATED", "READS");
                for meta in &secrets {
                    println!("{}", format_row(meta));
                }
            }
        }
    }
    Ok(true)
}

/// Actor name for audit records written from the CLI.
fn cli_actor() -> String {
    std::env::var("USER")
        .map(|user| format!("cli:{user}"))
        .unwrap_or_else(|_| "cli".into())
}

fn value_or_stdin(value: Option<String>) -> anyhow::Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read secret value from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn format_row(meta: &SecretMetadata) -> String {
    let rotated = if meta.last_rotated_at == meta.created_at {
        "-".to_string()
    } else {
        meta.last_rotated_at.format("%Y-%m-%d %H:%M").to_string()
    };
    format!(
        "{:<32} {:<20} {:<20} {:>8}",
        meta.key,
        meta.created_at.format("%Y-%m-%d %H:%M").to_string(),
        rotated,
        meta.access_count
    )
}
