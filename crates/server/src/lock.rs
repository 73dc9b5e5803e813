//! Single-instance advisory file lock. A second process pointed at the
//! same data directory must refuse to start.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another vectoraiz instance holds the lock at {}",
                path.display()
            )
        })?;
        tracing::info!(path = %path.display(), "process lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release process lock");
        } else {
            tracing::info!(path = %self.path.display(), "process lock released");
        }
    }
}
