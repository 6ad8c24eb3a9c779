//! File reads and writes on validated, canonical paths.
//!
//! Opens use `O_NOFOLLOW` so a link swapped in after validation is refused
//! rather than followed. Directories are never created.

use serde::Serialize;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::ExecError;

/// Bytes read from a file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    /// The file was longer than the read cap.
    pub truncated: bool,
}

/// Read at most `max_bytes` from `path`.
pub async fn read_file(path: &Path, max_bytes: usize) -> Result<FileContent, ExecError> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_NOFOLLOW);

    let file = options
        .open(path)
        .await
        .map_err(|e| ExecError::from_io(e, "open for reading"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|e| ExecError::from_io(e, "stat"))?;
    if !metadata.is_file() {
        return Err(ExecError::Failed("not a regular file".into()));
    }

    let mut bytes = Vec::new();
    file.take((max_bytes as u64).saturating_add(1))
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| ExecError::from_io(e, "read"))?;
    let truncated = bytes.len() > max_bytes;
    if truncated {
        bytes.truncate(max_bytes);
    }

    debug!(path = %path.display(), bytes = bytes.len(), truncated, "File read");
    Ok(FileContent { bytes, truncated })
}

/// Create or replace `path` with `content`. The parent directory must exist.
pub async fn write_file(path: &Path, content: &[u8]) -> Result<usize, ExecError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_NOFOLLOW).mode(0o644);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| ExecError::from_io(e, "open for writing"))?;
    file.write_all(content)
        .await
        .map_err(|e| ExecError::from_io(e, "write"))?;
    file.sync_all()
        .await
        .map_err(|e| ExecError::from_io(e, "sync"))?;

    debug!(path = %path.display(), bytes = content.len(), "File written");
    Ok(content.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        assert_eq!(write_file(&path, b"hello warden").await.unwrap(), 12);
        let content = read_file(&path, 1024).await.unwrap();
        assert_eq!(content.bytes, b"hello warden");
        assert!(!content.truncated);
    }

    #[tokio::test]
    async fn write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        write_file(&path, b"a much longer first version").await.unwrap();
        write_file(&path, b"short").await.unwrap();
        assert_eq!(read_file(&path, 1024).await.unwrap().bytes, b"short");
    }

    #[tokio::test]
    async fn read_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; 5000]).unwrap();
        let content = read_file(&path, 1000).await.unwrap();
        assert_eq!(content.bytes.len(), 1000);
        assert!(content.truncated);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("absent"), 10).await.unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
    }

    #[tokio::test]
    async fn write_needs_existing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_file(&dir.path().join("no/such/dir/file.txt"), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
        assert!(!dir.path().join("no").exists());
    }

    #[tokio::test]
    async fn directory_is_not_readable_as_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(dir.path(), 10).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, "secret").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = read_file(&link, 100).await.unwrap_err();
        assert!(matches!(err, ExecError::PermissionDenied(_)));
        let err = write_file(&link, b"overwrite").await.unwrap_err();
        assert!(matches!(err, ExecError::PermissionDenied(_)));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "secret");
    }
}
