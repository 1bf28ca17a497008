// SPDX-License-Identifier: GPL-3.0-only

//! The user-facing operations: create, mount, unmount and status
//!
//! Each operation acquires its resources in order inside a [`RollbackScope`],
//! so any failure or interruption releases whatever was taken, newest first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cryptbox_contracts::Backends;
use cryptbox_sys::ContainerStore;
use cryptbox_types::{
    ContainerError, Credential, FormatOptions, LoopDevice, MappingName, Resolution, Result,
    RuntimeConfig, key_file_path_for,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::allocator::DeviceAllocator;
use crate::interrupt::Interrupt;
use crate::mount::MountController;
use crate::rollback::RollbackScope;
use crate::volume::EncryptedVolume;

const MIB: u64 = 1024 * 1024;
const PROGRESS_STEP: u64 = 64 * MIB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub container: PathBuf,
    pub size_bytes: u64,
    /// Generate `<container>.pw` and format with it instead of prompting.
    pub generate_key_file: bool,
}

impl CreateRequest {
    /// Build a request from a size in MiB.
    pub fn from_mib(
        container: impl Into<PathBuf>,
        size_mib: u64,
        generate_key_file: bool,
    ) -> Result<Self> {
        let size_bytes = size_mib
            .checked_mul(MIB)
            .filter(|bytes| *bytes > 0)
            .ok_or(ContainerError::InvalidSize(size_mib))?;
        Ok(Self {
            container: container.into(),
            size_bytes,
            generate_key_file,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateOutcome {
    pub container: PathBuf,
    pub size_bytes: u64,
    pub key_file: Option<PathBuf>,
    pub wiped_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub container: PathBuf,
    pub mount_point: PathBuf,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountOutcome {
    pub container: PathBuf,
    pub mount_point: PathBuf,
    pub mapping: MappingName,
    pub block_device: PathBuf,
    pub loop_device: LoopDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmountOutcome {
    pub resolution: Resolution,
    /// Cleanup steps after the unmount that did not succeed.
    pub warnings: Vec<String>,
}

/// Per-path results of a batch unmount, in request order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<(PathBuf, Result<UnmountOutcome>)>,
    /// Paths never attempted because the batch was interrupted.
    pub skipped: Vec<PathBuf>,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, result)| result.is_err()).count() + self.skipped.len()
    }

    pub fn succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// Runs lifecycle operations against a set of backends.
pub struct Lifecycle {
    backends: Backends,
    interrupt: Interrupt,
}

impl Lifecycle {
    pub fn new(backends: Backends, interrupt: Interrupt) -> Self {
        Self {
            backends,
            interrupt,
        }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    fn allocator(&self, config: &RuntimeConfig) -> DeviceAllocator {
        DeviceAllocator::new(self.backends.loops(), config.settings.lock_file.clone())
    }

    fn store(&self, config: &RuntimeConfig) -> ContainerStore {
        ContainerStore::new(config.settings.key_file_bytes)
    }

    fn volume(&self, config: &RuntimeConfig, name: MappingName) -> EncryptedVolume {
        EncryptedVolume::new(
            self.backends.crypt(),
            self.backends.block(),
            &config.settings.mapper_dir,
            name,
        )
    }

    fn mount_controller(&self) -> MountController {
        MountController::new(self.backends.mounts(), self.backends.crypt())
    }

    /// Build a new encrypted container with a fresh filesystem.
    ///
    /// On success only the container file and the key file (if requested)
    /// remain; the loop device and mapping used to build it are released.
    pub fn create(&self, config: &RuntimeConfig, request: &CreateRequest) -> Result<CreateOutcome> {
        let container = request.container.as_path();
        let overwrite = config.force;
        let store = &self.store(config);
        let allocator = &self.allocator(config);
        let volume = self.volume(config, MappingName::from_container(container)?);
        let options = FormatOptions::from_config(&config.settings);

        let mut scope = RollbackScope::new("create");
        self.interrupt.check()?;

        info!(
            "Creating {} ({} bytes)",
            container.display(),
            request.size_bytes
        );
        store.validate_backing(container, request.size_bytes, overwrite)?;
        scope.push("remove container file", || store.remove(container));
        store.write_backing(
            container,
            request.size_bytes,
            Some(|written: u64| {
                if written % PROGRESS_STEP == 0 {
                    debug!("{} MiB written", written / MIB);
                }
                self.interrupt.check()
            }),
        )?;
        self.interrupt.check()?;

        let credential = if request.generate_key_file {
            let key_file = key_file_path_for(container);
            if store.generate_credential(&key_file, overwrite)? {
                let generated = key_file.clone();
                scope.push("remove key file", move || store.remove(&generated));
            } else {
                info!("Reusing existing key file {}", key_file.display());
            }
            Credential::KeyFile(key_file)
        } else {
            Credential::Interactive
        };
        self.interrupt.check()?;

        let device = allocator.acquire(container)?;
        let bound = device.clone();
        scope.push("release loop device", move || allocator.release(&bound));
        self.interrupt.check()?;

        volume.format(device.path(), &credential, &options)?;
        self.interrupt.check()?;

        volume.open(device.path(), &credential)?;
        scope.push("close mapping", || volume.close());
        self.interrupt.check()?;

        let wiped_bytes = volume.wipe(|wiped| {
            if wiped % PROGRESS_STEP == 0 {
                debug!("{} MiB wiped", wiped / MIB);
            }
            self.interrupt.check()
        })?;
        self.interrupt.check()?;

        volume.make_filesystem(&config.settings.filesystem)?;
        self.interrupt.check()?;

        volume.close()?;
        allocator.release(&device)?;
        scope.commit();

        info!("Created {}", container.display());
        Ok(CreateOutcome {
            container: container.to_path_buf(),
            size_bytes: request.size_bytes,
            key_file: credential.key_file().map(Path::to_path_buf),
            wiped_bytes,
        })
    }

    /// Attach a container and mount its filesystem.
    ///
    /// Every acquired resource stays in place on success.
    pub fn mount(&self, config: &RuntimeConfig, request: &MountRequest) -> Result<MountOutcome> {
        let container = request.container.as_path();
        validate_container(container)?;
        if let Some(key_file) = request.credential.key_file() {
            validate_key_file(key_file)?;
        }
        let controller = self.mount_controller();
        let mount_point = controller.validate_mount_point(&request.mount_point)?;

        let allocator = &self.allocator(config);
        let volume = self.volume(config, MappingName::from_container(container)?);

        let mut scope = RollbackScope::new("mount");
        self.interrupt.check()?;

        let device = allocator.acquire(container)?;
        let bound = device.clone();
        scope.push("release loop device", move || allocator.release(&bound));
        self.interrupt.check()?;

        let block_device = volume.open(device.path(), &request.credential)?;
        scope.push("close mapping", || volume.close());
        self.interrupt.check()?;

        let mount_point =
            controller.mount(&block_device, &mount_point, &config.settings.filesystem)?;
        scope.commit();

        info!(
            "Mounted {} on {}",
            container.display(),
            mount_point.display()
        );
        Ok(MountOutcome {
            container: container.to_path_buf(),
            mount_point,
            mapping: volume.name().clone(),
            block_device,
            loop_device: device,
        })
    }

    /// Unmount, then close the mapping and release the loop device behind it.
    ///
    /// Only resolution and the unmount itself can fail the operation; later
    /// cleanup failures are returned as warnings.
    pub fn unmount(&self, config: &RuntimeConfig, mount_point: &Path) -> Result<UnmountOutcome> {
        self.interrupt.check()?;
        let controller = self.mount_controller();
        let resolution = controller.resolve(mount_point)?;
        controller.unmount(&resolution.mount_point)?;

        let mut warnings = Vec::new();
        let volume = EncryptedVolume::attached(
            self.backends.crypt(),
            self.backends.block(),
            &config.settings.mapper_dir,
            resolution.mapping.clone(),
        );
        if let Err(error) = volume.close() {
            warn!("Could not close mapping {}: {}", resolution.mapping, error);
            warnings.push(format!("close mapping {}: {error}", resolution.mapping));
        }
        if let Err(error) = self.allocator(config).release(&resolution.loop_device) {
            warn!("Could not release {}: {}", resolution.loop_device, error);
            warnings.push(format!("release {}: {error}", resolution.loop_device));
        }

        Ok(UnmountOutcome {
            resolution,
            warnings,
        })
    }

    /// Unmount each path in order; failures are collected, not fatal.
    pub fn unmount_all(&self, config: &RuntimeConfig, mount_points: &[PathBuf]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (position, mount_point) in mount_points.iter().enumerate() {
            let result = self.unmount(config, mount_point);
            let stop = match &result {
                Ok(done) => {
                    info!("Unmounted {}", done.resolution.mount_point.display());
                    false
                }
                Err(error) => {
                    error!("{}: {}", mount_point.display(), error);
                    error.kind().is_fatal_to_batch()
                }
            };
            outcome.results.push((mount_point.clone(), result));
            if stop {
                outcome.skipped = mount_points[position + 1..].to_vec();
                break;
            }
        }
        outcome
    }

    /// Report the chain behind a mount point without changing anything.
    pub fn status(&self, mount_point: &Path) -> Result<Resolution> {
        self.mount_controller().resolve(mount_point)
    }
}

fn validate_container(path: &Path) -> Result<()> {
    let invalid = |reason: &str| ContainerError::InvalidContainer {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(invalid("not a regular file")),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Err(invalid("does not exist")),
        Err(error) => Err(ContainerError::io(path, error)),
    }
}

fn validate_key_file(path: &Path) -> Result<()> {
    let invalid = |reason: &str| ContainerError::InvalidKeyFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(invalid("not a regular file")),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Err(invalid("does not exist")),
        Err(error) => Err(ContainerError::io(path, error)),
    }
}
