// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use cryptbox_types::{Credential, FormatOptions, MappingName, MappingStatus, Result};

/// External encryption engine (LUKS).
pub trait CryptEngine: Send + Sync {
    fn format(&self, device: &Path, credential: &Credential, options: &FormatOptions)
    -> Result<()>;

    /// Attach the decrypted mapping `name`. Authentication failures surface as
    /// `WrongCredential`, everything else as `Open`.
    fn open(&self, device: &Path, credential: &Credential, name: &MappingName) -> Result<()>;

    /// Detach `name`; `Busy` while the mapping is still in use.
    fn close(&self, name: &MappingName) -> Result<()>;

    fn status(&self, name: &MappingName) -> Result<MappingStatus>;
}
