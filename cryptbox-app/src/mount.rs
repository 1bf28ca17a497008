// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cryptbox_contracts::{CryptEngine, MountOps};
use cryptbox_types::{ContainerError, LoopDevice, MappingName, Resolution, Result};
use tracing::{debug, info};

/// Mounts decrypted mappings and recovers the resource chain behind a mount point.
pub struct MountController {
    mounts: Arc<dyn MountOps>,
    engine: Arc<dyn CryptEngine>,
}

impl MountController {
    pub fn new(mounts: Arc<dyn MountOps>, engine: Arc<dyn CryptEngine>) -> Self {
        Self { mounts, engine }
    }

    /// Canonical path of a directory that is not already a mount point.
    pub fn validate_mount_point(&self, mount_point: &Path) -> Result<PathBuf> {
        let invalid = |reason: &str| ContainerError::InvalidMountPoint {
            path: mount_point.to_path_buf(),
            reason: reason.to_string(),
        };

        let canonical = match fs::canonicalize(mount_point) {
            Ok(path) => path,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(invalid("does not exist"));
            }
            Err(error) => return Err(ContainerError::io(mount_point, error)),
        };
        if !canonical.is_dir() {
            return Err(invalid("not a directory"));
        }
        if self.mounts.mounted_at(&canonical)?.is_some() {
            return Err(ContainerError::MountPointBusy(canonical));
        }
        Ok(canonical)
    }

    /// Mount `device` on `mount_point`, returning the canonical mount point.
    pub fn mount(&self, device: &Path, mount_point: &Path, fs_type: &str) -> Result<PathBuf> {
        let target = self.validate_mount_point(mount_point)?;
        self.mounts.mount(device, &target, fs_type)?;
        info!("Mounted {} on {}", device.display(), target.display());
        Ok(target)
    }

    /// Find the mapping and loop device behind a mount point.
    pub fn resolve(&self, mount_point: &Path) -> Result<Resolution> {
        let canonical = fs::canonicalize(mount_point)
            .map_err(|_| ContainerError::NotMounted(mount_point.to_path_buf()))?;

        let entry = self
            .mounts
            .mounted_at(&canonical)?
            .ok_or_else(|| ContainerError::NotMounted(canonical.clone()))?;
        let source = PathBuf::from(&entry.source);
        debug!("{} is mounted from {}", canonical.display(), source.display());

        let not_encrypted = || ContainerError::NotEncrypted {
            target: canonical.clone(),
            device: entry.source.clone(),
        };

        let mapping = source
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(MappingName::new)
            .ok_or_else(not_encrypted)?;

        let status = self.engine.status(&mapping)?;
        if !status.is_active()
            || status
                .kind
                .as_deref()
                .is_some_and(|kind| !kind.to_ascii_uppercase().starts_with("LUKS"))
        {
            return Err(not_encrypted());
        }

        let loop_device = status
            .backing_device
            .as_deref()
            .and_then(LoopDevice::from_path)
            .ok_or_else(not_encrypted)?;

        Ok(Resolution {
            mount_point: canonical,
            block_device: source,
            mapping,
            loop_device,
        })
    }

    pub fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.mounts.unmount(mount_point)?;
        info!("Unmounted {}", mount_point.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptbox_contracts::{BlockTools, LoopControl};
    use cryptbox_testing::SimHost;
    use cryptbox_types::{Credential, FormatOptions};

    fn controller(host: &SimHost) -> MountController {
        let backends = host.backends();
        MountController::new(backends.mounts(), backends.crypt())
    }

    /// Bind, format, open and mkfs `box.img` on loop0; returns the mapping device.
    fn open_volume(host: &SimHost, dir: &Path) -> PathBuf {
        let backing = dir.join("box.img");
        fs::write(&backing, vec![0u8; 4096]).unwrap();
        host.set_passphrase("pw");
        let device = LoopDevice::new(0);
        let name = MappingName::new("box.img").unwrap();
        host.bind(&device, &backing).unwrap();
        host.format(device.path(), &Credential::Interactive, &FormatOptions::default())
            .unwrap();
        host.open(device.path(), &Credential::Interactive, &name)
            .unwrap();
        let mapped = name.device_path(&host.mapper_dir());
        host.make_filesystem("ext4", &mapped).unwrap();
        mapped
    }

    #[test]
    fn rejects_missing_and_non_directory_mount_points() {
        let dir = tempfile::tempdir().unwrap();
        let host = SimHost::new(1);
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();

        let controller = controller(&host);
        assert!(matches!(
            controller.validate_mount_point(&dir.path().join("missing")),
            Err(ContainerError::InvalidMountPoint { .. })
        ));
        assert!(matches!(
            controller.validate_mount_point(&file),
            Err(ContainerError::InvalidMountPoint { .. })
        ));
    }

    #[test]
    fn mount_then_resolve_recovers_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir(&target).unwrap();
        let host = SimHost::new(1);
        let mapped = open_volume(&host, dir.path());

        let controller = controller(&host);
        let mounted = controller.mount(&mapped, &target, "ext4").unwrap();

        let resolution = controller.resolve(&target).unwrap();
        assert_eq!(resolution.mount_point, mounted);
        assert_eq!(resolution.block_device, mapped);
        assert_eq!(resolution.mapping.as_str(), "box.img");
        assert_eq!(resolution.loop_device.index(), 0);

        assert!(matches!(
            controller.mount(&mapped, &target, "ext4"),
            Err(ContainerError::MountPointBusy(_))
        ));
    }

    #[test]
    fn unmounted_path_is_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let host = SimHost::new(1);
        let error = controller(&host).resolve(dir.path()).unwrap_err();
        assert!(matches!(error, ContainerError::NotMounted(_)));
    }

    #[test]
    fn plain_mounts_are_not_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let host = SimHost::new(1);
        let target = fs::canonicalize(dir.path()).unwrap();
        host.add_foreign_mount("/dev/sdb1", &target, "ext4");

        let error = controller(&host).resolve(dir.path()).unwrap_err();
        assert!(matches!(error, ContainerError::NotEncrypted { .. }));
    }
}
