// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::LoopDevice;
use crate::mapping::MappingName;

/// One row of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mount source, e.g. `/dev/mapper/box.img`.
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
}

/// Resource chain recovered from a mount point alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub mount_point: PathBuf,
    pub block_device: PathBuf,
    pub mapping: MappingName,
    pub loop_device: LoopDevice,
}
