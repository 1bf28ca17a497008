// SPDX-License-Identifier: GPL-3.0-only

//! Whole-device writes: zero fill and filesystem creation

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use cryptbox_contracts::BlockTools;
use cryptbox_types::{ContainerError, Result};
use tracing::{debug, info};

use crate::cmd::{CommandRunner, args};
use crate::error::SysError;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SystemBlockTools {
    runner: CommandRunner,
}

impl SystemBlockTools {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

/// Overwrite every byte of `device` with zeros, reporting progress per chunk.
///
/// An error from the callback stops the fill.
pub fn zero_fill<F>(device: &Path, mut progress_callback: Option<F>) -> Result<u64>
where
    F: FnMut(u64) -> Result<()>,
{
    let io_error = |error| ContainerError::io(device, error);

    let mut dest = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(io_error)?;
    // Block devices report their size through the end offset, not metadata.
    let size = dest.seek(SeekFrom::End(0)).map_err(io_error)?;
    dest.seek(SeekFrom::Start(0)).map_err(io_error)?;

    let buffer = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    while written < size {
        let chunk = (size - written).min(CHUNK_SIZE as u64) as usize;
        dest.write_all(&buffer[..chunk]).map_err(io_error)?;
        written += chunk as u64;

        if let Some(ref mut callback) = progress_callback {
            callback(written)?;
        }
    }

    dest.sync_all().map_err(io_error)?;
    Ok(written)
}

impl BlockTools for SystemBlockTools {
    fn wipe(&self, device: &Path, progress: &mut dyn FnMut(u64) -> Result<()>) -> Result<u64> {
        info!("Wiping {}", device.display());
        let written = zero_fill(device, Some(progress))?;
        debug!("Wrote {} zero bytes to {}", written, device.display());
        Ok(written)
    }

    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<()> {
        let tool = format!("mkfs.{fs_type}");
        let binary = which::which(&tool).map_err(|_| SysError::BinaryNotFound(tool.clone()))?;

        info!("Creating {} filesystem on {}", fs_type, device.display());
        let output = self.runner.run(&binary, &args([device]))?;
        if output.success() {
            return Ok(());
        }
        Err(ContainerError::MakeFilesystem {
            fs_type: fs_type.to_string(),
            device: device.display().to_string(),
            reason: format!("{} (exit code {})", output.diagnostic(), output.status),
        })
    }
}
