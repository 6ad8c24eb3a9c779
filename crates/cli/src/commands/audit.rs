//! `warden audit`: Verify or inspect the audit log.

use anyhow::Context;
use clap::Subcommand;
use std::path::PathBuf;
use warden_config::AppConfig;
use warden_security::audit::read_records;
use warden_security::{AuditRecord, verify_chain};

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Check the hash chain for tampering or truncation
    Verify {
        /// Audit file (default: from config)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Print the most recent records
    Tail {
        /// Number of records
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,

        /// Audit file (default: from config)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

pub fn run(config: &AppConfig, action: AuditCommand) -> anyhow::Result<bool> {
    match action {
        AuditCommand::Verify { path } => {
            let path = path.unwrap_or_else(|| config.audit.resolved_path());
            let report = verify_chain(&path)
                .with_context(|| format!("Cannot verify {}", path.display()))?;
            match &report.first_break {
                None => {
                    println!("✅ {} records, chain intact", report.records);
                    Ok(true)
                }
                Some(brk) => {
                    println!("❌ Chain broken at line {}: {}", brk.line, brk.reason);
                    println!("   {} records read", report.records);
                    Ok(false)
                }
            }
        }
        AuditCommand::Tail { lines, path } => {
            let path = path.unwrap_or_else(|| config.audit.resolved_path());
            let records =
                read_records(&path).with_context(|| format!("Cannot read {}", path.display()))?;
            let skip = records.len().saturating_sub(lines);
            for record in &records[skip..] {
                println!("{}", format_record(record));
            }
            Ok(true)
        }
    }
}

fn format_record(record: &AuditRecord) -> String {
    let mut line = format!(
        "{} {:<10} {:<14} {:<8} {}",
        record.ts.format("%Y-%m-%dT%H:%M:%SZ"),
        record.actor,
        record.op.as_str(),
        format!("{:?}", record.outcome),
        record.target
    );
    if !record.detail.is_empty() {
        line.push_str(" | ");
        line.push_str(&record.detail);
    }
    line
}
