use std::io;
use warden_core::{ErrorKind, GatewayError};

/// Errors from running an already-validated operation.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Operation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Execution failed: {0}")]
    Failed(String),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Failed(_) => ErrorKind::ExecutionFailed,
        }
    }

    /// Map an OS error, naming what was being attempted.
    pub(crate) fn from_io(e: io::Error, what: &str) -> Self {
        #[cfg(unix)]
        if e.raw_os_error() == Some(libc::ELOOP) {
            return Self::PermissionDenied(format!("{what}: refusing to follow a symbolic link"));
        }
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(what.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(what.to_string()),
            _ => Self::Failed(format!("{what}: {e}")),
        }
    }
}

impl From<ExecError> for GatewayError {
    fn from(e: ExecError) -> Self {
        GatewayError::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_kinds() {
        let not_found = ExecError::from_io(io::Error::from(io::ErrorKind::NotFound), "open");
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let denied = ExecError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "open");
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let other = ExecError::from_io(io::Error::other("disk on fire"), "write");
        assert_eq!(other.kind(), ErrorKind::ExecutionFailed);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_permission_denied() {
        let e = ExecError::from_io(io::Error::from_raw_os_error(libc::ELOOP), "open");
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn converts_to_gateway_error() {
        let err: GatewayError = ExecError::Timeout { secs: 5 }.into();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.reason.contains("5s"));
    }
}
