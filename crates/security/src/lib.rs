//! Security layer for Warden: whitelist, validation, audit trail, and vault.
//!
//! Provides:
//! - **Whitelist**: Immutable registry of permitted commands, path roots, and URL schemes
//! - **Validation**: Command injection, path traversal, and URL checks before any side effect
//! - **Audit logging**: Hash-chained JSONL trail of every decision and outcome
//! - **Vault**: AES-256-GCM encrypted secrets with a cleartext metadata index
//! - **Lock**: Advisory file locks so one process owns the audit log and vault

pub mod audit;
pub mod lock;
pub mod validator;
pub mod vault;
pub mod whitelist;

pub use audit::{
    AuditError, AuditLogger, AuditOp, AuditOutcome, AuditRecord, AuditSink, ChainReport,
    JsonlFileSink, MemorySink, RequestTag, SinkError, TracingSink, verify_chain,
};
pub use lock::FileLock;
pub use validator::{Validator, validate_path, validate_secret_key, validate_url};
pub use vault::{EncryptedValue, SecretMetadata, SecretsVault, VaultError};
pub use whitelist::{EntryKind, WhitelistEntry, WhitelistError, WhitelistRegistry};
