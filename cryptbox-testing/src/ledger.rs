// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TestingError};

/// Resources a host still holds, captured after a lifecycle run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub label: String,
    /// `<loop node> -> <backing file>`
    pub loop_devices: Vec<String>,
    pub open_mappings: Vec<String>,
    pub mount_points: Vec<String>,
    pub updated_at: String,
}

impl HostSnapshot {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            updated_at: timestamp(),
            ..Self::default()
        }
    }

    /// No bound loop device, open mapping or mount remains.
    pub fn is_clean(&self) -> bool {
        self.loop_devices.is_empty() && self.open_mappings.is_empty() && self.mount_points.is_empty()
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.label))
    }
}

fn timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    format!("{}", duration.as_secs())
}

pub fn load(path: &Path) -> Result<HostSnapshot> {
    let raw = fs::read_to_string(path).map_err(|error| TestingError::LedgerIo {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;

    serde_json::from_str(&raw).map_err(|error| TestingError::LedgerIo {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

pub fn save(snapshot: &HostSnapshot, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|error| TestingError::LedgerIo {
        path: dir.to_path_buf(),
        reason: error.to_string(),
    })?;

    let path = snapshot.path_in(dir);
    let content =
        serde_json::to_string_pretty(snapshot).map_err(|error| TestingError::LedgerIo {
            path: path.clone(),
            reason: error.to_string(),
        })?;

    fs::write(&path, content).map_err(|error| TestingError::LedgerIo {
        path: path.clone(),
        reason: error.to_string(),
    })?;

    Ok(path)
}
