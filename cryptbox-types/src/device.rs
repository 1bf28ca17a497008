// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Directory holding the loop device nodes.
pub const LOOP_DEVICE_DIR: &str = "/dev";

/// A loopback block device node, ordered by kernel index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoopDevice {
    index: u32,
    path: PathBuf,
}

impl LoopDevice {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            path: Path::new(LOOP_DEVICE_DIR).join(format!("loop{index}")),
        }
    }

    pub fn with_path(index: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
        }
    }

    /// Parse a node path such as `/dev/loop7` (or a bare `loop7`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let index = parse_loop_index(path.file_name()?.to_str()?)?;
        Some(Self::with_path(index, path))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        format!("loop{}", self.index)
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Binding state reported by a non-destructive probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Free,
    Bound { backing: Option<PathBuf> },
}

impl LoopState {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// Extract `N` from `loopN`; partitions (`loop0p1`) and control nodes are rejected.
pub fn parse_loop_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("loop")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loop_node_names() {
        assert_eq!(parse_loop_index("loop0"), Some(0));
        assert_eq!(parse_loop_index("loop12"), Some(12));
        assert_eq!(parse_loop_index("loop-control"), None);
        assert_eq!(parse_loop_index("loop0p1"), None);
        assert_eq!(parse_loop_index("loop"), None);
        assert_eq!(parse_loop_index("sda"), None);
    }

    #[test]
    fn orders_by_index_not_by_name() {
        let mut devices = vec![LoopDevice::new(10), LoopDevice::new(2), LoopDevice::new(1)];
        devices.sort();
        let indexes: Vec<u32> = devices.iter().map(LoopDevice::index).collect();
        assert_eq!(indexes, vec![1, 2, 10]);
    }

    #[test]
    fn from_path_keeps_the_given_node() {
        let device = LoopDevice::from_path(Path::new("/dev/loop3")).expect("loop node");
        assert_eq!(device.index(), 3);
        assert_eq!(device.path(), Path::new("/dev/loop3"));
        assert_eq!(device.name(), "loop3");
    }
}
