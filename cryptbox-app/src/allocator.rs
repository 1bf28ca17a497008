// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cryptbox_contracts::LoopControl;
use cryptbox_sys::AllocationLock;
use cryptbox_types::{ContainerError, LoopDevice, LoopState, Result};
use tracing::{debug, info};

/// Finds, binds and releases loopback devices.
pub struct DeviceAllocator {
    loops: Arc<dyn LoopControl>,
    lock_file: Option<PathBuf>,
}

impl DeviceAllocator {
    pub fn new(loops: Arc<dyn LoopControl>, lock_file: Option<PathBuf>) -> Self {
        Self { loops, lock_file }
    }

    /// First node, by index, whose probe reports it unbound.
    pub fn allocate(&self) -> Result<LoopDevice> {
        for device in self.loops.candidates()? {
            match self.loops.probe(&device) {
                Ok(LoopState::Free) => {
                    debug!("Selected free loop device {}", device);
                    return Ok(device);
                }
                Ok(LoopState::Bound { backing }) => {
                    debug!("{} is bound to {:?}", device, backing);
                }
                Err(error) => {
                    debug!("Skipping {}: {}", device, error);
                }
            }
        }

        if let Some(device) = self.loops.request_free()? {
            if self.loops.probe(&device)?.is_free() {
                debug!("Loop control provided {}", device);
                return Ok(device);
            }
        }

        Err(ContainerError::NoDeviceAvailable)
    }

    pub fn bind(&self, device: &LoopDevice, backing: &Path) -> Result<()> {
        self.loops.bind(device, backing)
    }

    /// Allocate and bind under the allocation lock.
    pub fn acquire(&self, backing: &Path) -> Result<LoopDevice> {
        let _lock = match &self.lock_file {
            Some(path) => Some(AllocationLock::acquire(path)?),
            None => None,
        };
        let device = self.allocate()?;
        self.bind(&device, backing)?;
        info!("Attached {} to {}", backing.display(), device);
        Ok(device)
    }

    /// Unbind `device`; already-free devices succeed.
    pub fn release(&self, device: &LoopDevice) -> Result<()> {
        self.loops.unbind(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptbox_testing::{SimHost, SimOp};
    use std::fs;

    fn allocator(host: &SimHost) -> DeviceAllocator {
        DeviceAllocator::new(host.backends().loops(), None)
    }

    #[test]
    fn picks_the_lowest_free_index() {
        let host = SimHost::new(4);
        host.occupy(0, "/srv/other.img");
        host.occupy(2, "/srv/third.img");

        let device = allocator(&host).allocate().unwrap();
        assert_eq!(device.index(), 1);
    }

    #[test]
    fn all_bound_is_no_device_available() {
        let host = SimHost::new(2);
        host.occupy(0, "/srv/a.img");
        host.occupy(1, "/srv/b.img");

        let error = allocator(&host).allocate().unwrap_err();
        assert!(matches!(error, ContainerError::NoDeviceAvailable));
    }

    #[test]
    fn falls_back_to_loop_control() {
        let host = SimHost::new(1).with_loop_control();
        host.occupy(0, "/srv/a.img");

        let device = allocator(&host).allocate().unwrap();
        assert_eq!(device.index(), 1);
    }

    #[test]
    fn probe_errors_skip_the_node() {
        let host = SimHost::new(2);
        host.fail_next(SimOp::Probe, || {
            ContainerError::io("/dev/loop0", std::io::Error::other("gone"))
        });

        let device = allocator(&host).allocate().unwrap();
        assert_eq!(device.index(), 1);
    }

    #[test]
    fn acquire_takes_the_lock_and_binds() {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("box.img");
        fs::write(&backing, b"data").unwrap();
        let host = SimHost::new(2);
        let allocator = DeviceAllocator::new(
            host.backends().loops(),
            Some(dir.path().join("lock").join("cryptbox.lock")),
        );

        let device = allocator.acquire(&backing).unwrap();
        assert_eq!(host.bound_loops(), vec![(device.index(), backing.clone())]);
        assert!(dir.path().join("lock").join("cryptbox.lock").exists());

        allocator.release(&device).unwrap();
        allocator.release(&device).unwrap();
        assert!(host.bound_loops().is_empty());
    }

    #[test]
    fn lost_race_surfaces_as_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("box.img");
        fs::write(&backing, b"data").unwrap();
        let host = SimHost::new(2);
        // Another process binds loop0 between our probe and bind.
        let racer = host.clone();
        host.after(SimOp::Probe, move || racer.occupy(0, "/srv/racer.img"));

        let error = allocator(&host).acquire(&backing).unwrap_err();
        assert!(matches!(error, ContainerError::Bind { .. }));
    }
}
