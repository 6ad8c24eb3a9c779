//! `warden config`: Show or initialize configuration.

use anyhow::{Context, bail};
use clap::Subcommand;
use std::path::Path;
use warden_config::AppConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file and create the workspace
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}

pub fn run(explicit: Option<&Path>, action: ConfigCommand) -> anyhow::Result<bool> {
    match action {
        ConfigCommand::Show => show(explicit),
        ConfigCommand::Init { force } => init(explicit, force),
        ConfigCommand::Path => {
            println!("{}", AppConfig::config_path(explicit).display());
            Ok(true)
        }
    }
}

/// The config holds env var names and file paths, never secret values, so
/// it prints as is.
fn show(explicit: Option<&Path>) -> anyhow::Result<bool> {
    let config = AppConfig::load_with(explicit).context("Failed to load config")?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(true)
}

fn init(explicit: Option<&Path>, force: bool) -> anyhow::Result<bool> {
    let config_path = AppConfig::config_path(explicit);
    write_default(&config_path, force)?;
    println!("✅ Wrote {}", config_path.display());

    let workspace_dir = AppConfig::workspace_dir();
    if !workspace_dir.exists() {
        std::fs::create_dir_all(&workspace_dir)
            .with_context(|| format!("Cannot create {}", workspace_dir.display()))?;
        println!("✅ Created workspace directory: {}", workspace_dir.display());
    }

    println!();
    println!("Next steps:");
    println!("  export WARDEN_VAULT_PASSPHRASE=...   # unlocks the secrets vault");
    println!("  export WARDEN_API_TOKENS=...         # enables bearer auth on /v1");
    println!("  warden serve");
    Ok(true)
}

fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}
