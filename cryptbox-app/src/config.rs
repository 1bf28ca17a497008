// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use cryptbox_types::config::DEFAULT_CONFIG_PATH;
use cryptbox_types::{ContainerConfig, Result};
use tracing::debug;

/// Settings from `explicit` (which must exist), else the system file if present, else defaults.
pub fn load(explicit: Option<&Path>) -> Result<ContainerConfig> {
    load_from(explicit, Path::new(DEFAULT_CONFIG_PATH))
}

fn load_from(explicit: Option<&Path>, system: &Path) -> Result<ContainerConfig> {
    if let Some(path) = explicit {
        debug!("Loading configuration from {}", path.display());
        return ContainerConfig::load(path);
    }
    if system.is_file() {
        debug!("Loading configuration from {}", system.display());
        return ContainerConfig::load(system);
    }
    Ok(ContainerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptbox_types::ContainerError;
    use std::fs;

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load_from(Some(&missing), &dir.path().join("system.toml")),
            Err(ContainerError::Config(_))
        ));
    }

    #[test]
    fn system_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        assert_eq!(load_from(None, &system).unwrap(), ContainerConfig::default());

        fs::write(&system, "filesystem = \"xfs\"\n").unwrap();
        assert_eq!(load_from(None, &system).unwrap().filesystem, "xfs");
    }
}
