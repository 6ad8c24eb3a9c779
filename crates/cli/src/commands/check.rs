//! `warden check`: Dry-run validation. Nothing is executed or audited.

use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;
use warden_config::AppConfig;
use warden_core::{CallerContext, CommandPlan, ValidationRequest, ValidationResult};
use warden_security::{Validator, WhitelistRegistry};

#[derive(Subcommand)]
pub enum CheckTarget {
    /// Validate a command line
    Command { line: String },

    /// Validate a path relative to a base directory
    Path {
        path: String,

        /// Base directory (default: the first whitelisted path root)
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },

    /// Validate a URL
    Url { url: String },

    /// Validate a secret key name
    Key { key: String },
}

pub fn run(config: &AppConfig, target: CheckTarget) -> anyhow::Result<bool> {
    let registry = Arc::new(WhitelistRegistry::from_config(&config.whitelist)?);
    let validator = Validator::new(registry, config.network.block_private_hosts);
    let ctx = CallerContext::new("cli");

    let (request, is_command) = match target {
        CheckTarget::Command { line } => (ValidationRequest::command(line, ctx), true),
        CheckTarget::Path { path, base_dir } => {
            let base = base_dir
                .or_else(|| validator.registry().path_roots().next())
                .unwrap_or_else(AppConfig::workspace_dir);
            (ValidationRequest::path(path, base, ctx), false)
        }
        CheckTarget::Url { url } => (ValidationRequest::url(url, ctx), false),
        CheckTarget::Key { key } => (ValidationRequest::secret_key(key, ctx), false),
    };

    let result = validator.validate(&request);
    println!("{}", render(&result));

    if is_command && let Some(line) = result.sanitized() {
        let plan = validator.command_plan(line)?;
        println!("   {}", describe_plan(&plan));
    }
    Ok(result.is_allowed())
}

fn render(result: &ValidationResult) -> String {
    match (result.sanitized(), result.error_kind()) {
        (Some(sanitized), _) => format!("✅ Allowed: {sanitized}"),
        (None, Some(kind)) => format!("❌ Rejected: {kind}: {}", result.reason().unwrap_or_default()),
        (None, None) => "❌ Rejected".to_string(),
    }
}

fn describe_plan(plan: &CommandPlan) -> String {
    match plan {
        CommandPlan::Direct { program, args } => {
            format!("Runs without a shell: {program} {}", args.join(" "))
                .trim_end()
                .to_string()
        }
        CommandPlan::Shell { line } => format!("Runs through sh -c: {line}"),
    }
}
