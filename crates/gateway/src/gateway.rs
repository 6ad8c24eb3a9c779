//! The gateway: validate, record intent, execute, record outcome.
//!
//! Every operation follows the same shape. A rejected request produces one
//! `Rejected` record and never reaches the executor. An allowed request
//! produces an `Allowed` record, runs, then exactly one `Executed` or
//! `Failed` record. All records of one call share a request id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use warden_config::AppConfig;
use warden_core::{CallerContext, ErrorKind, GatewayError, ValidationRequest, ValidationResult};
use warden_executor::{CommandOutput, ExecError, Executor, FileContent, HttpResponse};
use warden_security::validator::validate_secret_key;
use warden_security::{
    AuditError, AuditLogger, AuditOp, AuditOutcome, AuditRecord, RequestTag, SecretMetadata,
    SecretsVault, Validator, WhitelistError, WhitelistRegistry,
};

/// Errors building the gateway at startup.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Invalid whitelist: {0}")]
    Whitelist(#[from] WhitelistError),

    #[error("Cannot open audit log: {0}")]
    Audit(#[from] AuditError),

    #[error("Cannot build executor: {0}")]
    Executor(#[from] ExecError),
}

/// Result of a file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub path: PathBuf,
    pub bytes_written: usize,
}

/// Health summary for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GatewayStatus {
    pub audit_degraded: bool,
    pub audit_lost_records: u64,
    pub audit_unsynced_records: u64,
    pub vault_unlocked: bool,
    pub vault_keys: usize,
    pub whitelisted_commands: usize,
    pub path_roots: usize,
    pub url_schemes: Vec<String>,
}

/// Composition root. Owns the validator, executor, audit log and vault.
pub struct Gateway {
    validator: Validator,
    executor: Executor,
    audit: Arc<AuditLogger>,
    vault: Option<Arc<SecretsVault>>,
    vault_locked_reason: String,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("validator", &self.validator)
            .field("audit", &self.audit)
            .field("vault_unlocked", &self.vault.is_some())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build every subsystem from configuration.
    ///
    /// A vault that cannot be opened (no passphrase, wrong passphrase) does
    /// not stop startup; secret operations then fail with `VaultLocked`.
    pub fn from_config(config: &AppConfig) -> Result<Self, InitError> {
        let registry = Arc::new(WhitelistRegistry::from_config(&config.whitelist)?);
        let validator = Validator::new(registry, config.network.block_private_hosts);
        let executor = Executor::new(config.executor.clone())?;
        let audit = Arc::new(AuditLogger::from_config(&config.audit)?);

        let (vault, reason) = match SecretsVault::from_config(&config.vault, audit.clone()) {
            Ok(vault) => (Some(Arc::new(vault)), String::new()),
            Err(e) => {
                warn!(error = %e, "Secrets vault unavailable; secret operations will fail");
                (None, e.to_string())
            }
        };

        Ok(Self {
            validator,
            executor,
            audit,
            vault,
            vault_locked_reason: reason,
        })
    }

    /// Assemble from parts already built.
    pub fn new(
        validator: Validator,
        executor: Executor,
        audit: Arc<AuditLogger>,
        vault: Option<Arc<SecretsVault>>,
    ) -> Self {
        Self {
            validator,
            executor,
            audit,
            vault,
            vault_locked_reason: "vault is not configured".into(),
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn status(&self) -> GatewayStatus {
        let registry = self.validator.registry();
        GatewayStatus {
            audit_degraded: self.audit.is_degraded(),
            audit_lost_records: self.audit.lost_records(),
            audit_unsynced_records: self.audit.unsynced_records(),
            vault_unlocked: self.vault.is_some(),
            vault_keys: self.vault.as_ref().map_or(0, |v| v.len()),
            whitelisted_commands: registry.count(warden_security::EntryKind::Command),
            path_roots: registry.count(warden_security::EntryKind::Path),
            url_schemes: registry.url_schemes(),
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────

    /// Validate and run a command line. `timeout_s = 0` uses the configured
    /// default; larger values are clamped to the configured maximum.
    pub async fn run_command(
        &self,
        ctx: &CallerContext,
        raw: &str,
        timeout_s: u64,
    ) -> Result<CommandOutput, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        let verdict = self.validator.validate_command(raw);
        let line = self.admit(&tag, AuditOp::RunCommand, raw, verdict)?;

        let plan = match self.validator.command_plan(&line) {
            Ok(plan) => plan,
            Err(e) => {
                self.write_audit(tag.record(
                    AuditOp::RunCommand,
                    &line,
                    AuditOutcome::Failed,
                    e.kind.as_str(),
                ));
                return Err(e);
            }
        };

        let timeout = self.executor.effective_timeout(timeout_s);
        let result = self.executor.run(&plan, timeout).await;
        self.settle(&tag, AuditOp::RunCommand, &line, result, |out| {
            let exit = out
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            with_truncation(format!("exit {exit} in {}ms", out.duration_ms), out.truncated)
        })
    }

    // ── Files ─────────────────────────────────────────────────────────────

    pub async fn read_file(
        &self,
        ctx: &CallerContext,
        raw_path: &str,
        base_dir: &Path,
    ) -> Result<FileContent, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        let verdict = self
            .validator
            .validate(&ValidationRequest::path(raw_path, base_dir, ctx.clone()));
        let path = self.admit(&tag, AuditOp::ReadFile, raw_path, verdict)?;

        let result = self.executor.read_file(Path::new(&path)).await;
        self.settle(&tag, AuditOp::ReadFile, &path, result, |content| {
            with_truncation(format!("{} bytes", content.bytes.len()), content.truncated)
        })
    }

    pub async fn write_file(
        &self,
        ctx: &CallerContext,
        raw_path: &str,
        base_dir: &Path,
        content: &[u8],
    ) -> Result<WriteReceipt, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        let verdict = self
            .validator
            .validate(&ValidationRequest::path(raw_path, base_dir, ctx.clone()));
        let path = self.admit(&tag, AuditOp::WriteFile, raw_path, verdict)?;

        let result = self
            .executor
            .write_file(Path::new(&path), content)
            .await
            .map(|bytes_written| WriteReceipt {
                path: PathBuf::from(&path),
                bytes_written,
            });
        self.settle(&tag, AuditOp::WriteFile, &path, result, |receipt| {
            format!("{} bytes", receipt.bytes_written)
        })
    }

    // ── HTTP ──────────────────────────────────────────────────────────────

    pub async fn http_get(&self, ctx: &CallerContext, raw_url: &str) -> Result<HttpResponse, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        let verdict = self.validator.validate_url(raw_url);
        let url = self.admit(&tag, AuditOp::HttpGet, raw_url, verdict)?;

        let result = self.executor.http_get(&url).await;
        self.settle(&tag, AuditOp::HttpGet, &url, result, describe_response)
    }

    pub async fn http_post(
        &self,
        ctx: &CallerContext,
        raw_url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<HttpResponse, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        let verdict = self.validator.validate_url(raw_url);
        let url = self.admit(&tag, AuditOp::HttpPost, raw_url, verdict)?;

        let result = self.executor.http_post(&url, body, content_type).await;
        self.settle(&tag, AuditOp::HttpPost, &url, result, describe_response)
    }

    // ── Secrets ───────────────────────────────────────────────────────────
    //
    // The gateway records the key-name verdict; the vault records the outcome.

    pub fn secret_get(&self, ctx: &CallerContext, key: &str) -> Result<String, GatewayError> {
        let (tag, vault) = self.admit_secret(ctx, AuditOp::SecretGet, key)?;
        vault.get(&tag, key).map_err(GatewayError::from)
    }

    pub fn secret_add(&self, ctx: &CallerContext, key: &str, value: &str) -> Result<(), GatewayError> {
        let (tag, vault) = self.admit_secret(ctx, AuditOp::SecretAdd, key)?;
        vault.add(&tag, key, value).map_err(GatewayError::from)
    }

    pub fn secret_rotate(
        &self,
        ctx: &CallerContext,
        key: &str,
        new_value: &str,
    ) -> Result<(), GatewayError> {
        let (tag, vault) = self.admit_secret(ctx, AuditOp::SecretRotate, key)?;
        vault.rotate(&tag, key, new_value).map_err(GatewayError::from)
    }

    pub fn secret_delete(&self, ctx: &CallerContext, key: &str) -> Result<(), GatewayError> {
        let (tag, vault) = self.admit_secret(ctx, AuditOp::SecretDelete, key)?;
        vault.delete(&tag, key).map_err(GatewayError::from)
    }

    pub fn secret_list(&self, ctx: &CallerContext) -> Result<Vec<SecretMetadata>, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        self.write_audit(tag.record(AuditOp::SecretList, "*", AuditOutcome::Allowed, ""));
        let vault = self.unlocked_vault(&tag, AuditOp::SecretList, "*")?;
        Ok(vault.list(&tag))
    }

    /// Re-read the vault files from disk.
    pub fn secret_reload(&self, ctx: &CallerContext) -> Result<usize, GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        self.write_audit(tag.record(AuditOp::SecretReload, "*", AuditOutcome::Allowed, ""));
        let vault = self.unlocked_vault(&tag, AuditOp::SecretReload, "*")?;
        vault.reload(&tag).map_err(GatewayError::from)
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Append one record. The write ends in an fsync, so on a multi-threaded
    /// runtime the worker is handed off first and other tasks keep running.
    pub fn write_audit(&self, record: AuditRecord) {
        let on_worker = Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
        if on_worker {
            tokio::task::block_in_place(|| self.audit.record(record));
        } else {
            self.audit.record(record);
        }
    }

    /// Record the verdict. Returns the sanitized value when allowed.
    fn admit(
        &self,
        tag: &RequestTag,
        op: AuditOp,
        raw: &str,
        verdict: ValidationResult,
    ) -> Result<String, GatewayError> {
        match verdict.into_result() {
            Ok(sanitized) => {
                debug!(op = %op, actor = %tag.actor, "Request allowed");
                self.write_audit(tag.record(op, &sanitized, AuditOutcome::Allowed, ""));
                Ok(sanitized)
            }
            Err(e) => {
                warn!(op = %op, actor = %tag.actor, kind = %e.kind, "Request rejected");
                self.write_audit(tag.record(
                    op,
                    raw,
                    AuditOutcome::Rejected,
                    format!("{}: {}", e.kind, e.reason),
                ));
                Err(e)
            }
        }
    }

    /// Record the outcome of an executed step.
    fn settle<T>(
        &self,
        tag: &RequestTag,
        op: AuditOp,
        target: &str,
        result: Result<T, ExecError>,
        describe: impl FnOnce(&T) -> String,
    ) -> Result<T, GatewayError> {
        match result {
            Ok(value) => {
                self.write_audit(tag.record(op, target, AuditOutcome::Executed, describe(&value)));
                Ok(value)
            }
            Err(e) => {
                warn!(op = %op, actor = %tag.actor, error = %e, "Operation failed");
                self.write_audit(tag.record(
                    op,
                    target,
                    AuditOutcome::Failed,
                    format!("{}: {e}", e.kind()),
                ));
                Err(e.into())
            }
        }
    }

    fn admit_secret(
        &self,
        ctx: &CallerContext,
        op: AuditOp,
        key: &str,
    ) -> Result<(RequestTag, &SecretsVault), GatewayError> {
        let tag = RequestTag::for_caller(ctx);
        self.admit(&tag, op, key, validate_secret_key(key))?;
        let vault = self.unlocked_vault(&tag, op, key)?;
        Ok((tag, vault))
    }

    fn unlocked_vault(
        &self,
        tag: &RequestTag,
        op: AuditOp,
        target: &str,
    ) -> Result<&SecretsVault, GatewayError> {
        match &self.vault {
            Some(vault) => Ok(vault.as_ref()),
            None => {
                self.write_audit(tag.record(
                    op,
                    target,
                    AuditOutcome::Failed,
                    ErrorKind::VaultLocked.as_str(),
                ));
                Err(GatewayError::new(
                    ErrorKind::VaultLocked,
                    self.vault_locked_reason.clone(),
                ))
            }
        }
    }
}

fn describe_response(response: &HttpResponse) -> String {
    with_truncation(
        format!("status {}, {} bytes", response.status, response.body.len()),
        response.truncated,
    )
}

fn with_truncation(detail: String, truncated: bool) -> String {
    if truncated {
        format!("{detail}; {}", ErrorKind::Truncated)
    } else {
        detail
    }
}
