//! Cross-process ownership of on-disk state using advisory file locks (fs2
//! flock).
//!
//! The audit log and the vault are each owned by exactly one open handle. A
//! `warden secret` run next to a live `warden serve` must fail instead of
//! forking the hash chain or overwriting the server's vault writes.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive lock on `<target>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take the lock for `target` without waiting. Returns `None` when
    /// another handle (in this or any other process) holds it.
    pub fn try_acquire(target: &Path) -> io::Result<Option<Self>> {
        let path = lock_path(target);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Sibling lock file: `audit.jsonl` locks `audit.jsonl.lock`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
