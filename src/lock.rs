//! Advisory whole-process build lock.
//!
//! One lock guards the full apply sequence (garbage collection, build, boot
//! menu regeneration). Acquisition is non-blocking: a second invocation
//! fails immediately with [`Error::AlreadyRunning`] naming the lock file
//! and, when readable, the holder recorded in it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default lock file; overridable with `DARCH_LOCK_FILE` (used by tests).
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/darch.lock";

/// Metadata written into the lock file so a contending process can name
/// the holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub command: String,
    pub started_at_unix: u64,
}

/// Held build lock. The flock is released when the file handle drops, on
/// every exit path including abnormal termination. The lock file itself is
/// left in place: unlinking a file another process may still hold a lock
/// on would let a third process acquire a fresh lock at the same path.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

/// Resolve the lock path, honoring the `DARCH_LOCK_FILE` override.
pub fn lock_path() -> PathBuf {
    match std::env::var_os("DARCH_LOCK_FILE") {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(DEFAULT_LOCK_PATH),
    }
}

impl BuildLock {
    /// Try to take the exclusive lock at `path`, without blocking.
    pub fn acquire(path: &Path, command: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::AlreadyRunning {
                lock_path: path.to_path_buf(),
                holder: read_holder(path),
            }
            .into());
        }

        write_metadata(&file, command)?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_metadata(mut file: &File, command: &str) -> Result<()> {
    let metadata = LockMetadata {
        pid: std::process::id(),
        command: command.to_string(),
        started_at_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };

    file.set_len(0).context("failed to truncate lock file")?;
    let bytes = serde_json::to_vec_pretty(&metadata)?;
    file.write_all(&bytes)
        .context("failed to write lock metadata")?;
    file.flush().context("failed to flush lock metadata")?;
    Ok(())
}

fn read_holder(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let meta: LockMetadata = serde_json::from_str(&contents).ok()?;
    Some(format!("{}, pid {}", meta.command, meta.pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.lock");

        let lock = BuildLock::acquire(&path, "apply").unwrap();
        assert!(lock.path().exists());

        let meta: LockMetadata =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(meta.pid, std::process::id());
        assert_eq!(meta.command, "apply");
    }

    #[test]
    fn contention_is_already_running() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.lock");

        let _held = BuildLock::acquire(&path, "apply").unwrap();
        let err = BuildLock::acquire(&path, "gc").unwrap_err();

        match err.downcast_ref::<Error>() {
            Some(Error::AlreadyRunning { lock_path, holder }) => {
                assert_eq!(lock_path, &path);
                assert!(holder.as_deref().unwrap().contains("apply"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.lock");

        {
            let _lock = BuildLock::acquire(&path, "first").unwrap();
        }
        // A second acquisition must succeed once the first handle is gone.
        let _lock = BuildLock::acquire(&path, "second").unwrap();
    }
}
