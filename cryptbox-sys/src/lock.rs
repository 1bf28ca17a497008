// SPDX-License-Identifier: GPL-3.0-only

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use cryptbox_types::{ContainerError, Result};
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

/// Exclusive advisory lock held across loop device probe and bind.
///
/// Released when dropped. Only cooperating processes that take the same lock
/// are serialized.
#[derive(Debug)]
pub struct AllocationLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl AllocationLock {
    /// Block until the lock at `path` is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| ContainerError::io(parent, error))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|error| ContainerError::io(path, error))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| ContainerError::io(path, io::Error::from(errno)))?;
        debug!("Holding allocation lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AllocationLock {
    fn drop(&mut self) {
        debug!("Releasing allocation lock {}", self.path.display());
    }
}
