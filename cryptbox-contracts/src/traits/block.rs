// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use cryptbox_types::Result;

/// Whole-device writes on a decrypted mapping.
pub trait BlockTools: Send + Sync {
    /// Zero the full extent of `device`, returning the number of bytes written.
    ///
    /// `progress` sees the running total; an error from it aborts the wipe.
    fn wipe(&self, device: &Path, progress: &mut dyn FnMut(u64) -> Result<()>) -> Result<u64>;

    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<()>;
}
