//! Error types for the Warden domain.
//!
//! Uses `thiserror` for ergonomic error definitions. `ErrorKind` is the
//! closed taxonomy every rejection and failure is reported with; the
//! bounded-context errors of the other crates map onto it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The closed set of error kinds surfaced to gateway callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // --- Validation ---
    DisallowedCommand,
    DangerousCharacter,
    PathTraversal,
    InvalidScheme,
    ForbiddenHost,
    MalformedInput,

    // --- Execution ---
    Timeout,
    Truncated,
    NotFound,
    PermissionDenied,
    ExecutionFailed,

    // --- Vault ---
    VaultLocked,
    KeyNotFound,
    KeyAlreadyExists,

    // --- Audit ---
    LoggingDegraded,
}

impl ErrorKind {
    /// Stable name used in audit records and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DisallowedCommand => "DisallowedCommand",
            Self::DangerousCharacter => "DangerousCharacter",
            Self::PathTraversal => "PathTraversal",
            Self::InvalidScheme => "InvalidScheme",
            Self::ForbiddenHost => "ForbiddenHost",
            Self::MalformedInput => "MalformedInput",
            Self::Timeout => "Timeout",
            Self::Truncated => "Truncated",
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::ExecutionFailed => "ExecutionFailed",
            Self::VaultLocked => "VaultLocked",
            Self::KeyNotFound => "KeyNotFound",
            Self::KeyAlreadyExists => "KeyAlreadyExists",
            Self::LoggingDegraded => "LoggingDegraded",
        }
    }

    /// Whether this kind is produced by the validator (before any side effect).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DisallowedCommand
                | Self::DangerousCharacter
                | Self::PathTraversal
                | Self::InvalidScheme
                | Self::ForbiddenHost
                | Self::MalformedInput
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error a gateway caller sees: a kind plus a short human-readable reason.
///
/// The reason never contains the raw caller input or whitelist internals.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// The top-level error type for Warden operations outside the gateway call path
/// (startup, configuration, tooling).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
