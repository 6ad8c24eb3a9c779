//! Warden CLI: the main entry point.
//!
//! Commands:
//! - `serve`: Start the HTTP gateway
//! - `check`: Dry-run validation of a command, path or URL
//! - `secret`: Manage vault secrets
//! - `audit`: Verify or inspect the audit log
//! - `config`: Show or initialize configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use warden_config::AppConfig;

mod commands;

use commands::{audit::AuditCommand, check::CheckTarget, config_cmd::ConfigCommand, secret::SecretCommand};

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Warden: validation, sandboxed execution and audit gateway",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (default: ~/.warden/config.toml)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate input without executing anything
    Check {
        #[command(subcommand)]
        target: CheckTarget,
    },

    /// Manage secrets in the vault
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },

    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let explicit = cli.config.as_deref();
    tracing::debug!(path = %AppConfig::config_path(explicit).display(), "Using configuration file");
    let ok = match cli.command {
        // `config` must work before a valid config file exists.
        Commands::Config { action } => commands::config_cmd::run(explicit, action)?,
        Commands::Serve { port } => commands::serve::run(AppConfig::load_with(explicit)?, port).await?,
        Commands::Check { target } => commands::check::run(&AppConfig::load_with(explicit)?, target)?,
        Commands::Secret { action } => commands::secret::run(&AppConfig::load_with(explicit)?, action)?,
        Commands::Audit { action } => commands::audit::run(&AppConfig::load_with(explicit)?, action)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Logs go to stderr so command output on stdout stays pipeable.
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
