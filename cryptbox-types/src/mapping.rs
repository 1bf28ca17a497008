// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::error::{ContainerError, Result};

/// Device-mapper names are limited to 127 bytes plus the terminator.
pub const MAX_MAPPING_NAME_LEN: usize = 127;

/// Name of a decrypted device-mapper mapping (`/dev/mapper/<name>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingName(String);

impl MappingName {
    /// Validate an existing mapping name as reported by the kernel or engine.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.len() > MAX_MAPPING_NAME_LEN
            || name.contains('/')
        {
            return None;
        }
        Some(Self(name))
    }

    /// Derive the mapping name for a container from its file name.
    ///
    /// The same container always maps to the same name; characters outside
    /// `[A-Za-z0-9._+-]` are replaced with `_`.
    pub fn from_container(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ContainerError::InvalidMappingName(path.to_path_buf()))?;

        let mut sanitized: String = file_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        sanitized.truncate(MAX_MAPPING_NAME_LEN);

        Self::new(sanitized).ok_or_else(|| ContainerError::InvalidMappingName(path.to_path_buf()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn device_path(&self, mapper_dir: &Path) -> PathBuf {
        mapper_dir.join(&self.0)
    }
}

impl fmt::Display for MappingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingState {
    Active,
    Inactive,
}

/// Engine view of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStatus {
    pub name: MappingName,
    pub state: MappingState,
    /// Underlying block device (`device:` line of the engine status).
    pub backing_device: Option<PathBuf>,
    /// Engine type string, e.g. `LUKS2`.
    pub kind: Option<String>,
}

impl MappingStatus {
    pub fn inactive(name: MappingName) -> Self {
        Self {
            name,
            state: MappingState::Inactive,
            backing_device: None,
            kind: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == MappingState::Active
    }
}

/// Tuning passed to the engine's format operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub luks_type: String,
    pub cipher: Option<String>,
    pub key_size: Option<u32>,
    pub hash: Option<String>,
}

impl FormatOptions {
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            luks_type: config.luks_type.clone(),
            cipher: config.cipher.clone(),
            key_size: config.key_size,
            hash: config.hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_file_name() {
        let name = MappingName::from_container(Path::new("/srv/vaults/secret.img")).unwrap();
        assert_eq!(name.as_str(), "secret.img");
        assert_eq!(
            name.device_path(Path::new("/dev/mapper")),
            PathBuf::from("/dev/mapper/secret.img")
        );
    }

    #[test]
    fn replaces_unsafe_characters() {
        let name = MappingName::from_container(Path::new("/tmp/my vault:1")).unwrap();
        assert_eq!(name.as_str(), "my_vault_1");
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = MappingName::from_container(Path::new("/a/box.bin")).unwrap();
        let b = MappingName::from_container(Path::new("/b/box.bin")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_paths_without_a_name() {
        assert!(MappingName::from_container(Path::new("/")).is_err());
        assert!(MappingName::from_container(Path::new("..")).is_err());
        assert!(MappingName::new("a/b").is_none());
    }

    #[test]
    fn truncates_long_names() {
        let long = "x".repeat(300);
        let name = MappingName::from_container(Path::new(&long)).unwrap();
        assert_eq!(name.as_str().len(), MAX_MAPPING_NAME_LEN);
    }
}
