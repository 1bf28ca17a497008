// SPDX-License-Identifier: GPL-3.0-only

//! Loopback devices through the kernel loop ioctls
//!
//! Probing uses `LOOP_GET_STATUS64`, which fails with `ENXIO` on an unbound
//! node and never changes the node's state.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use cryptbox_contracts::LoopControl;
use cryptbox_types::{ContainerError, LoopDevice, LoopState, Result, parse_loop_index};
use nix::errno::Errno;
use tracing::{debug, info};

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }

    /// Backing path as recorded by the kernel; truncated to 63 bytes.
    fn file_name(&self) -> Option<PathBuf> {
        let end = self
            .lo_file_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(LO_NAME_SIZE);
        if end == 0 {
            return None;
        }
        Some(PathBuf::from(
            String::from_utf8_lossy(&self.lo_file_name[..end]).into_owned(),
        ))
    }
}

mod ioctls {
    use super::LoopInfo64;

    nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
    nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);
    nix::ioctl_read_bad!(loop_get_status64, 0x4C05, LoopInfo64);
    nix::ioctl_none_bad!(loop_ctl_get_free, 0x4C82);
}

/// Loop control against `/dev/loopN` and `/sys/block`.
#[derive(Debug, Clone)]
pub struct KernelLoopControl {
    dev_dir: PathBuf,
    sys_block: PathBuf,
    limit: u32,
}

impl KernelLoopControl {
    pub fn new(limit: u32) -> Self {
        Self::with_roots("/dev", "/sys/block", limit)
    }

    pub fn with_roots(dev_dir: impl Into<PathBuf>, sys_block: impl Into<PathBuf>, limit: u32) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sys_block: sys_block.into(),
            limit,
        }
    }

    fn open_node(&self, device: &LoopDevice, write: bool) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(device.path())
            .map_err(|error| ContainerError::io(device.path(), error))
    }

    /// `/sys/block/loopN/loop/backing_file`, untruncated unlike the ioctl copy.
    fn sysfs_backing_file(&self, device: &LoopDevice) -> Option<PathBuf> {
        let path = self
            .sys_block
            .join(device.name())
            .join("loop")
            .join("backing_file");
        let raw = fs::read_to_string(path).ok()?;
        let trimmed = raw.trim_end_matches('\n');
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }
}

impl LoopControl for KernelLoopControl {
    fn candidates(&self) -> Result<Vec<LoopDevice>> {
        let entries = fs::read_dir(&self.dev_dir)
            .map_err(|error| ContainerError::io(&self.dev_dir, error))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| ContainerError::io(&self.dev_dir, error))?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_loop_index) else {
                continue;
            };
            if index >= self.limit {
                continue;
            }
            devices.push(LoopDevice::with_path(index, entry.path()));
        }
        devices.sort();
        debug!("Found {} loop device candidates", devices.len());
        Ok(devices)
    }

    fn probe(&self, device: &LoopDevice) -> Result<LoopState> {
        let file = self.open_node(device, false)?;
        let mut info = LoopInfo64::zeroed();
        match unsafe { ioctls::loop_get_status64(file.as_raw_fd(), &mut info) } {
            Ok(_) => {
                let backing = self
                    .sysfs_backing_file(device)
                    .or_else(|| info.file_name());
                Ok(LoopState::Bound { backing })
            }
            Err(Errno::ENXIO) => Ok(LoopState::Free),
            Err(errno) => Err(ContainerError::io(device.path(), io::Error::from(errno))),
        }
    }

    fn bind(&self, device: &LoopDevice, backing: &Path) -> Result<()> {
        let bind_error = |reason: String| ContainerError::Bind {
            device: device.to_string(),
            backing: backing.to_path_buf(),
            reason,
        };

        let backing_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(backing)
            .map_err(|error| ContainerError::io(backing, error))?;
        let node = self.open_node(device, true)?;

        match unsafe { ioctls::loop_set_fd(node.as_raw_fd(), backing_file.as_raw_fd()) } {
            Ok(_) => {
                info!("Bound {} to {}", device, backing.display());
                Ok(())
            }
            Err(Errno::EBUSY) => Err(bind_error("device was bound by another process".into())),
            Err(errno) => Err(bind_error(errno.desc().to_string())),
        }
    }

    fn unbind(&self, device: &LoopDevice) -> Result<()> {
        let node = match self.open_node(device, false) {
            Ok(node) => node,
            Err(ContainerError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("{} no longer exists", device);
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        match unsafe { ioctls::loop_clr_fd(node.as_raw_fd()) } {
            Ok(_) => {
                info!("Released {}", device);
                Ok(())
            }
            Err(Errno::ENXIO) => {
                debug!("{} was already free", device);
                Ok(())
            }
            Err(Errno::EBUSY) => Err(ContainerError::busy(
                device.to_string(),
                "loop device is still in use",
            )),
            Err(errno) => Err(ContainerError::io(device.path(), io::Error::from(errno))),
        }
    }

    fn request_free(&self) -> Result<Option<LoopDevice>> {
        let control_path = self.dev_dir.join("loop-control");
        let control = match OpenOptions::new().read(true).write(true).open(&control_path) {
            Ok(control) => control,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(ContainerError::io(control_path, error)),
        };

        match unsafe { ioctls::loop_ctl_get_free(control.as_raw_fd()) } {
            Ok(index) => {
                let Ok(index) = u32::try_from(index) else {
                    return Ok(None);
                };
                let device =
                    LoopDevice::with_path(index, self.dev_dir.join(format!("loop{index}")));
                debug!("Loop control offered {}", device);
                Ok(Some(device))
            }
            Err(Errno::ENOSPC) | Err(Errno::ENODEV) => Ok(None),
            Err(errno) => Err(ContainerError::io(control_path, io::Error::from(errno))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_nodes_in_index_order_within_limit() {
        let dev = tempfile::tempdir().expect("tempdir");
        for name in ["loop10", "loop2", "loop-control", "loop0p1", "loop300", "sda"] {
            File::create(dev.path().join(name)).expect("create node");
        }
        let control = KernelLoopControl::with_roots(dev.path(), dev.path(), 256);
        let indexes: Vec<u32> = control
            .candidates()
            .expect("scan")
            .iter()
            .map(LoopDevice::index)
            .collect();
        assert_eq!(indexes, vec![2, 10]);
    }

    #[test]
    fn reads_backing_file_from_sysfs() {
        let sys = tempfile::tempdir().expect("tempdir");
        let dir = sys.path().join("loop4").join("loop");
        fs::create_dir_all(&dir).expect("sysfs dir");
        fs::write(dir.join("backing_file"), "/srv/box.img\n").expect("backing file");

        let control = KernelLoopControl::with_roots("/dev", sys.path(), 256);
        assert_eq!(
            control.sysfs_backing_file(&LoopDevice::new(4)),
            Some(PathBuf::from("/srv/box.img"))
        );
        assert_eq!(control.sysfs_backing_file(&LoopDevice::new(5)), None);
    }

    #[test]
    fn loop_info_file_name_stops_at_nul() {
        let mut info = LoopInfo64::zeroed();
        assert_eq!(info.file_name(), None);
        info.lo_file_name[..6].copy_from_slice(b"/a.img");
        assert_eq!(info.file_name(), Some(PathBuf::from("/a.img")));
    }

    #[test]
    fn loop_info_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn missing_control_node_offers_nothing() {
        let dev = tempfile::tempdir().expect("tempdir");
        let control = KernelLoopControl::with_roots(dev.path(), dev.path(), 256);
        assert_eq!(control.request_free().expect("request"), None);
    }
}
