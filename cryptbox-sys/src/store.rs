// SPDX-License-Identifier: GPL-3.0-only

//! Container files and generated key files on disk

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use cryptbox_types::{ContainerError, Result};
use rand::RngCore;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Creates and removes the files a container is made of.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    key_file_bytes: usize,
}

impl ContainerStore {
    pub fn new(key_file_bytes: usize) -> Self {
        Self { key_file_bytes }
    }

    /// Check that a backing file may be written at `path` without touching it.
    pub fn validate_backing(&self, path: &Path, size_bytes: u64, overwrite: bool) -> Result<()> {
        if size_bytes == 0 {
            return Err(ContainerError::InvalidSize(size_bytes));
        }
        match fs::symlink_metadata(path) {
            Ok(_) if !overwrite => Err(ContainerError::AlreadyExists(path.to_path_buf())),
            Ok(meta) if !meta.is_file() => Err(ContainerError::InvalidContainer {
                path: path.to_path_buf(),
                reason: "exists and is not a regular file".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ContainerError::io(path, error)),
        }
    }

    /// Fill `path` with `size_bytes` of random data, replacing any prior contents.
    ///
    /// The callback sees the running total after each chunk; an error from it
    /// stops the write and is returned as is.
    pub fn write_backing<F>(
        &self,
        path: &Path,
        size_bytes: u64,
        mut progress_callback: Option<F>,
    ) -> Result<u64>
    where
        F: FnMut(u64) -> Result<()>,
    {
        let io_error = |error| ContainerError::io(path, error);

        info!("Writing {} random bytes to {}", size_bytes, path.display());
        let mut dest = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(io_error)?;

        let mut rng = rand::rng();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        while written < size_bytes {
            let chunk = (size_bytes - written).min(CHUNK_SIZE as u64) as usize;
            rng.fill_bytes(&mut buffer[..chunk]);
            dest.write_all(&buffer[..chunk]).map_err(io_error)?;
            written += chunk as u64;

            if let Some(ref mut callback) = progress_callback {
                callback(written)?;
            }
        }

        dest.sync_all().map_err(io_error)?;
        Ok(written)
    }

    pub fn create_backing(&self, path: &Path, size_bytes: u64, overwrite: bool) -> Result<u64> {
        self.validate_backing(path, size_bytes, overwrite)?;
        self.write_backing(path, size_bytes, None::<fn(u64) -> Result<()>>)
    }

    /// Write a fresh random key file, returning whether one was generated.
    ///
    /// An existing file is kept unless `overwrite` is set. The file is staged
    /// next to its destination and renamed into place with mode 0400.
    pub fn generate_credential(&self, path: &Path, overwrite: bool) -> Result<bool> {
        let io_error = |error| ContainerError::io(path, error);

        if !overwrite && path.exists() {
            debug!("Keeping existing key file {}", path.display());
            return Ok(false);
        }

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut key = Zeroizing::new(vec![0u8; self.key_file_bytes]);
        rand::rng().fill_bytes(&mut key);

        let mut temp = NamedTempFile::new_in(parent).map_err(io_error)?;
        temp.as_file_mut().write_all(&key).map_err(io_error)?;
        temp.as_file_mut().flush().map_err(io_error)?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400)).map_err(io_error)?;
        temp.as_file().sync_all().map_err(io_error)?;
        temp.persist(path).map_err(|error| io_error(error.error))?;

        info!("Generated key file {}", path.display());
        Ok(true)
    }

    /// Delete `path` if present.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ContainerError::io(path, error)),
        }
    }
}
