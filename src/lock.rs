use crate::error::UpdateError;
use crate::ota::transaction::LOCK_FILE;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive advisory lock held for the duration of an update, so only one updater
/// mutates an installation at a time. Released on drop.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(install_dir: &Path) -> Result<Self, UpdateError> {
        let path = install_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => {
                debug!("Acquired updater lock {:?}", path);
                Ok(Self { file, path })
            }
            Ok(false) => Err(UpdateError::AlreadyRunning(path)),
            Err(e) => Err(UpdateError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {}", self.path, e);
        }
    }
}
