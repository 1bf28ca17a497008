// SPDX-License-Identifier: GPL-3.0-only

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cryptbox_contracts::{BlockTools, CryptEngine};
use cryptbox_types::{ContainerError, Credential, FormatOptions, MappingName, Result};
use tracing::{debug, info};

/// One encrypted volume and its decrypted mapping.
///
/// `closed --format--> closed --open--> open --close--> closed`
pub struct EncryptedVolume {
    engine: Arc<dyn CryptEngine>,
    block: Arc<dyn BlockTools>,
    mapper_dir: PathBuf,
    name: MappingName,
    open: Cell<bool>,
}

impl EncryptedVolume {
    pub fn new(
        engine: Arc<dyn CryptEngine>,
        block: Arc<dyn BlockTools>,
        mapper_dir: impl Into<PathBuf>,
        name: MappingName,
    ) -> Self {
        Self {
            engine,
            block,
            mapper_dir: mapper_dir.into(),
            name,
            open: Cell::new(false),
        }
    }

    /// A volume whose mapping is already active, e.g. recovered from a mount.
    pub fn attached(
        engine: Arc<dyn CryptEngine>,
        block: Arc<dyn BlockTools>,
        mapper_dir: impl Into<PathBuf>,
        name: MappingName,
    ) -> Self {
        let volume = Self::new(engine, block, mapper_dir, name);
        volume.open.set(true);
        volume
    }

    pub fn name(&self) -> &MappingName {
        &self.name
    }

    /// `/dev/mapper/<name>`
    pub fn device_path(&self) -> PathBuf {
        self.name.device_path(&self.mapper_dir)
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    pub fn format(
        &self,
        device: &Path,
        credential: &Credential,
        options: &FormatOptions,
    ) -> Result<()> {
        if self.is_open() {
            return Err(self.not_closed(device));
        }
        self.engine.format(device, credential, options)
    }

    /// Attach the mapping and return its device path.
    pub fn open(&self, device: &Path, credential: &Credential) -> Result<PathBuf> {
        if self.is_open() {
            return Err(self.not_closed(device));
        }
        self.engine.open(device, credential, &self.name)?;
        self.open.set(true);
        info!("Opened {} as {}", device.display(), self.device_path().display());
        Ok(self.device_path())
    }

    /// Detach the mapping. Closing a volume that is not open does nothing.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            debug!("Mapping {} is not open", self.name);
            return Ok(());
        }
        self.engine.close(&self.name)?;
        self.open.set(false);
        info!("Closed mapping {}", self.name);
        Ok(())
    }

    /// Zero the whole decrypted extent. An error from `progress` aborts the wipe.
    pub fn wipe<F>(&self, mut progress: F) -> Result<u64>
    where
        F: FnMut(u64) -> Result<()>,
    {
        self.require_open("wipe")?;
        self.block.wipe(&self.device_path(), &mut progress)
    }

    pub fn make_filesystem(&self, fs_type: &str) -> Result<()> {
        self.require_open("make a filesystem on")?;
        self.block.make_filesystem(fs_type, &self.device_path())
    }

    fn require_open(&self, action: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ContainerError::System(format!(
                "cannot {action} mapping {}: it is not open",
                self.name
            )))
        }
    }

    fn not_closed(&self, device: &Path) -> ContainerError {
        ContainerError::Open {
            device: device.display().to_string(),
            name: self.name.to_string(),
            reason: "the mapping is already open".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptbox_contracts::LoopControl;
    use cryptbox_testing::SimHost;
    use cryptbox_types::LoopDevice;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        host: SimHost,
        device: LoopDevice,
        credential: Credential,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("box.img");
        fs::write(&backing, vec![0u8; 8192]).unwrap();
        let key = dir.path().join("box.img.pw");
        fs::write(&key, b"secret").unwrap();

        let host = SimHost::new(1);
        let device = LoopDevice::new(0);
        host.bind(&device, &backing).unwrap();
        Fixture {
            _dir: dir,
            host,
            device,
            credential: Credential::KeyFile(key),
        }
    }

    fn volume(host: &SimHost) -> EncryptedVolume {
        let backends = host.backends();
        EncryptedVolume::new(
            backends.crypt(),
            backends.block(),
            host.mapper_dir(),
            MappingName::new("box.img").unwrap(),
        )
    }

    #[test]
    fn tracks_open_state_through_the_cycle() {
        let f = fixture();
        let volume = volume(&f.host);

        volume
            .format(f.device.path(), &f.credential, &FormatOptions::default())
            .unwrap();
        assert!(!volume.is_open());

        let mapped = volume.open(f.device.path(), &f.credential).unwrap();
        assert_eq!(mapped, PathBuf::from("/dev/mapper/box.img"));
        assert!(volume.is_open());
        assert_eq!(volume.wipe(|_| Ok(())).unwrap(), 8192);
        volume.make_filesystem("ext4").unwrap();

        volume.close().unwrap();
        assert!(!volume.is_open());
        volume.close().unwrap();
        assert_eq!(
            f.host.verbs(),
            vec!["bind", "format", "open", "wipe", "mkfs", "close"]
        );
    }

    #[test]
    fn wipe_requires_an_open_mapping() {
        let f = fixture();
        assert!(volume(&f.host).wipe(|_| Ok(())).is_err());
    }

    #[test]
    fn wipe_stops_when_progress_fails() {
        let f = fixture();
        let volume = volume(&f.host);
        volume
            .format(f.device.path(), &f.credential, &FormatOptions::default())
            .unwrap();
        volume.open(f.device.path(), &f.credential).unwrap();

        let error = volume
            .wipe(|_| Err(ContainerError::Interrupted))
            .unwrap_err();
        assert!(matches!(error, ContainerError::Interrupted));
        assert!(!f.host.verbs().contains(&"wipe".to_string()));
        assert!(volume.is_open());
    }

    #[test]
    fn open_twice_is_refused() {
        let f = fixture();
        let volume = volume(&f.host);
        volume
            .format(f.device.path(), &f.credential, &FormatOptions::default())
            .unwrap();
        volume.open(f.device.path(), &f.credential).unwrap();

        let error = volume.open(f.device.path(), &f.credential).unwrap_err();
        assert!(matches!(error, ContainerError::Open { .. }));
    }
}
