//! Cross-process lifecycle lock.
//!
//! Every `wgpilotd` invocation opens its own engine, so the in-process
//! mutex alone cannot keep two CLI calls from interleaving their
//! allocate/persist/apply sequences. An exclusive advisory lock on a file
//! next to the database serializes them.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::error::{EngineError, Result};

/// An advisory lock file shared by every process using the same database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFile {
    path: PathBuf,
}

/// A held lock. Dropping it closes the file, which releases the lock.
#[derive(Debug)]
pub struct LockFileGuard {
    _file: File,
}

impl LockFile {
    /// A lock at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock belonging to the database at `database_path`, e.g.
    /// `wgpilot.lock` for `wgpilot.db`.
    pub fn beside(database_path: &Path) -> Self {
        Self::new(database_path.with_extension("lock"))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lock`] if the file cannot be opened or locked.
    pub async fn acquire(&self) -> Result<LockFileGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || lock_exclusive(&path))
            .await
            .map_err(|e| EngineError::Lock(format!("lock task failed: {e}")))?
    }
}

fn lock_exclusive(path: &Path) -> Result<LockFileGuard> {
    let failed = |e: std::io::Error| EngineError::Lock(format!("{}: {e}", path.display()));

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(failed)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(failed)?;
    FileExt::lock_exclusive(&file).map_err(failed)?;

    debug!(path = %path.display(), "lifecycle lock acquired");
    Ok(LockFileGuard { _file: file })
}
