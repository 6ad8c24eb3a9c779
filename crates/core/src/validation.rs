//! Validation request/result types shared by the validator and the gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ErrorKind, GatewayError};

/// The closed set of operation kinds the gateway understands.
///
/// Each kind has exactly one validator and one executor path; adding an
/// operation means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Command,
    Path,
    Url,
    Secret,
}

/// Who is asking. Carried into every audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl CallerContext {
    pub fn new(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        Self {
            actor: if actor.trim().is_empty() {
                "anonymous".into()
            } else {
                actor
            },
            session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

impl Default for CallerContext {
    fn default() -> Self {
        Self::new("anonymous")
    }
}

/// A single validation request. Built per call and dropped after validation.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub kind: OperationKind,
    pub raw: String,
    pub context: CallerContext,
    /// Base directory for `Path` requests; ignored otherwise.
    pub base_dir: Option<PathBuf>,
}

impl ValidationRequest {
    pub fn command(raw: impl Into<String>, context: CallerContext) -> Self {
        Self {
            kind: OperationKind::Command,
            raw: raw.into(),
            context,
            base_dir: None,
        }
    }

    pub fn path(raw: impl Into<String>, base_dir: impl Into<PathBuf>, context: CallerContext) -> Self {
        Self {
            kind: OperationKind::Path,
            raw: raw.into(),
            context,
            base_dir: Some(base_dir.into()),
        }
    }

    pub fn url(raw: impl Into<String>, context: CallerContext) -> Self {
        Self {
            kind: OperationKind::Url,
            raw: raw.into(),
            context,
            base_dir: None,
        }
    }

    pub fn secret_key(raw: impl Into<String>, context: CallerContext) -> Self {
        Self {
            kind: OperationKind::Secret,
            raw: raw.into(),
            context,
            base_dir: None,
        }
    }
}

/// Verdict of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Allowed,
    Rejected,
}

/// The result of validating one request.
///
/// Fields are private: `Allowed` always carries a sanitized value and no
/// error kind, `Rejected` always carries an error kind and no sanitized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    outcome: Outcome,
    sanitized: Option<String>,
    error_kind: Option<ErrorKind>,
    reason: Option<String>,
}

impl ValidationResult {
    pub fn allowed(sanitized: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Allowed,
            sanitized: Some(sanitized.into()),
            error_kind: None,
            reason: None,
        }
    }

    pub fn rejected(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Rejected,
            sanitized: None,
            error_kind: Some(kind),
            reason: Some(reason.into()),
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allowed
    }

    pub fn sanitized(&self) -> Option<&str> {
        self.sanitized.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Convert into the sanitized value or the caller-facing error.
    pub fn into_result(self) -> Result<String, GatewayError> {
        match (self.sanitized, self.error_kind) {
            (Some(sanitized), None) => Ok(sanitized),
            (_, Some(kind)) => Err(GatewayError::new(
                kind,
                self.reason.unwrap_or_else(|| "rejected".into()),
            )),
            (None, None) => Err(GatewayError::new(
                ErrorKind::MalformedInput,
                "empty validation result",
            )),
        }
    }
}
