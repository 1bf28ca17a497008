// SPDX-License-Identifier: GPL-3.0-only

//! Mount syscalls and the live mount table

use std::fs;
use std::path::{Path, PathBuf};

use cryptbox_contracts::MountOps;
use cryptbox_types::{ContainerError, MountEntry, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, info};

use crate::error::SysError;

#[derive(Debug, Clone)]
pub struct SystemMounts {
    mountinfo: PathBuf,
    sys_block: PathBuf,
    mapper_dir: PathBuf,
}

impl SystemMounts {
    pub fn new(mapper_dir: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
            sys_block: PathBuf::from("/sys/block"),
            mapper_dir: mapper_dir.into(),
        }
    }

    pub fn with_roots(
        mountinfo: impl Into<PathBuf>,
        sys_block: impl Into<PathBuf>,
        mapper_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mountinfo: mountinfo.into(),
            sys_block: sys_block.into(),
            mapper_dir: mapper_dir.into(),
        }
    }

    pub fn entries(&self) -> Result<Vec<MountEntry>> {
        let raw = fs::read_to_string(&self.mountinfo)
            .map_err(|error| ContainerError::io(&self.mountinfo, error))?;
        let mut entries = parse_mountinfo(&raw)?;
        for entry in &mut entries {
            entry.source = self.normalize_source(&entry.source);
        }
        Ok(entries)
    }

    /// Some kernels report `/dev/dm-N` instead of the mapper alias.
    fn normalize_source(&self, source: &str) -> String {
        let Some(dm) = source.strip_prefix("/dev/") else {
            return source.to_string();
        };
        if !dm.starts_with("dm-") {
            return source.to_string();
        }
        match fs::read_to_string(self.sys_block.join(dm).join("dm").join("name")) {
            Ok(name) if !name.trim().is_empty() => self
                .mapper_dir
                .join(name.trim())
                .display()
                .to_string(),
            _ => source.to_string(),
        }
    }
}

impl MountOps for SystemMounts {
    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<()> {
        nix::mount::mount(
            Some(device),
            target,
            Some(fs_type),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|errno| ContainerError::Mount {
            device: device.display().to_string(),
            target: target.to_path_buf(),
            reason: errno.desc().to_string(),
        })?;
        info!("Mounted {} on {}", device.display(), target.display());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match nix::mount::umount2(target, MntFlags::empty()) {
            Ok(()) => {
                info!("Unmounted {}", target.display());
                Ok(())
            }
            Err(Errno::EBUSY) => Err(ContainerError::busy(
                target.display().to_string(),
                "target is busy",
            )),
            Err(Errno::EINVAL) => Err(ContainerError::NotMounted(target.to_path_buf())),
            Err(errno) => Err(ContainerError::Unmount {
                target: target.to_path_buf(),
                reason: errno.desc().to_string(),
            }),
        }
    }

    fn mounted_at(&self, target: &Path) -> Result<Option<MountEntry>> {
        // The last matching row is the topmost mount.
        let entry = self
            .entries()?
            .into_iter()
            .rev()
            .find(|entry| entry.target == target);
        debug!(
            "Mount table lookup for {}: {:?}",
            target.display(),
            entry.as_ref().map(|entry| &entry.source)
        );
        Ok(entry)
    }
}

/// Parse `/proc/self/mountinfo` rows into entries, in table order.
pub fn parse_mountinfo(input: &str) -> std::result::Result<Vec<MountEntry>, SysError> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (left, right) = line
            .split_once(" - ")
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        let target = left
            .split_whitespace()
            .nth(4)
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields
            .next()
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;
        let source = right_fields
            .next()
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        entries.push(MountEntry {
            source: unescape_mount_field(source),
            target: PathBuf::from(unescape_mount_field(target)),
            fs_type: fs_type.to_string(),
        });
    }

    Ok(entries)
}

/// Decode the `\NNN` octal escapes the kernel uses for spaces and friends.
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }
        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
        37 25 0:5 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw\n\
        90 36 253:3 / /mnt/my\\040vault rw,relatime shared:50 - ext4 /dev/mapper/box.img rw\n\
        91 36 253:4 / /mnt/other rw,relatime - ext4 /dev/dm-4 rw\n";

    #[test]
    fn parses_rows_with_optional_fields_and_escapes() {
        let entries = parse_mountinfo(SAMPLE).expect("parse should succeed");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].target, PathBuf::from("/mnt/my vault"));
        assert_eq!(entries[2].source, "/dev/mapper/box.img");
        assert_eq!(entries[2].fs_type, "ext4");
    }

    #[test]
    fn rejects_rows_without_separator() {
        assert!(parse_mountinfo("36 25 8:2 / / rw\n").is_err());
    }

    #[test]
    fn resolves_dm_nodes_to_mapper_names() {
        let root = tempfile::tempdir().expect("tempdir");
        let mountinfo = root.path().join("mountinfo");
        fs::write(&mountinfo, SAMPLE).expect("write mountinfo");
        let dm = root.path().join("dm-4").join("dm");
        fs::create_dir_all(&dm).expect("dm dir");
        fs::write(dm.join("name"), "other.img\n").expect("dm name");

        let mounts = SystemMounts::with_roots(&mountinfo, root.path(), "/dev/mapper");
        let entry = mounts
            .mounted_at(Path::new("/mnt/other"))
            .expect("lookup")
            .expect("mounted");
        assert_eq!(entry.source, "/dev/mapper/other.img");
        assert_eq!(mounts.mounted_at(Path::new("/mnt/none")).expect("lookup"), None);
    }

    #[test]
    fn topmost_mount_wins() {
        let root = tempfile::tempdir().expect("tempdir");
        let mountinfo = root.path().join("mountinfo");
        fs::write(
            &mountinfo,
            "50 1 0:1 / /mnt/x rw - tmpfs tmpfs rw\n51 50 253:0 / /mnt/x rw - ext4 /dev/mapper/a rw\n",
        )
        .expect("write mountinfo");
        let mounts = SystemMounts::with_roots(&mountinfo, root.path(), "/dev/mapper");
        let entry = mounts
            .mounted_at(Path::new("/mnt/x"))
            .expect("lookup")
            .expect("mounted");
        assert_eq!(entry.source, "/dev/mapper/a");
    }
}
