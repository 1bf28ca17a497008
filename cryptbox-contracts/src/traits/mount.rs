// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use cryptbox_types::{MountEntry, Result};

/// Mount syscalls and the live mount table.
pub trait MountOps: Send + Sync {
    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Entry mounted exactly at `target` (already canonical), if any.
    fn mounted_at(&self, target: &Path) -> Result<Option<MountEntry>>;
}
