// SPDX-License-Identifier: GPL-3.0-only

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-facing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Usage,
    ResourceUnavailable,
    Authentication,
    Io,
    StateInconsistency,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::ResourceUnavailable => "resource unavailable",
            Self::Authentication => "authentication",
            Self::Io => "i/o",
            Self::StateInconsistency => "state inconsistency",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether a failure of this kind is fatal to a batch of independent items.
    pub fn is_fatal_to_batch(self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid container size {0}: must be a positive integer")]
    InvalidSize(u64),

    #[error("{0:?} already exists (use -f to overwrite)")]
    AlreadyExists(PathBuf),

    #[error("container {path:?} is not usable: {reason}")]
    InvalidContainer { path: PathBuf, reason: String },

    #[error("mount point {path:?} is not usable: {reason}")]
    InvalidMountPoint { path: PathBuf, reason: String },

    #[error("key file {path:?} is not usable: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("cannot derive a mapping name from {0:?}")]
    InvalidMappingName(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no free loop device available")]
    NoDeviceAvailable,

    #[error("could not bind {device} to {backing:?}: {reason}")]
    Bind {
        device: String,
        backing: PathBuf,
        reason: String,
    },

    #[error("{resource} is busy: {reason}")]
    Busy { resource: String, reason: String },

    #[error("mount point {0:?} is already mounted")]
    MountPointBusy(PathBuf),

    #[error("wrong passphrase or key for {device}: {reason}")]
    WrongCredential { device: String, reason: String },

    #[error("failed to format {device}: {reason}")]
    Format { device: String, reason: String },

    #[error("failed to open {device} as {name}: {reason}")]
    Open {
        device: String,
        name: String,
        reason: String,
    },

    #[error("failed to create {fs_type} filesystem on {device}: {reason}")]
    MakeFilesystem {
        fs_type: String,
        device: String,
        reason: String,
    },

    #[error("failed to mount {device} on {target:?}: {reason}")]
    Mount {
        device: String,
        target: PathBuf,
        reason: String,
    },

    #[error("failed to unmount {target:?}: {reason}")]
    Unmount { target: PathBuf, reason: String },

    #[error("{0:?} is not mounted")]
    NotMounted(PathBuf),

    #[error("{device} mounted on {target:?} is not an active encrypted mapping")]
    NotEncrypted { target: PathBuf, device: String },

    #[error("command failed: {command}; {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("system error: {0}")]
    System(String),

    #[error("interrupted")]
    Interrupted,
}

impl ContainerError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn busy(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSize(_)
            | Self::InvalidContainer { .. }
            | Self::InvalidMountPoint { .. }
            | Self::InvalidKeyFile { .. }
            | Self::InvalidMappingName(_)
            | Self::Config(_) => ErrorKind::Usage,
            Self::NoDeviceAvailable
            | Self::Bind { .. }
            | Self::Busy { .. }
            | Self::AlreadyExists(_)
            | Self::MountPointBusy(_) => ErrorKind::ResourceUnavailable,
            Self::WrongCredential { .. } => ErrorKind::Authentication,
            Self::Format { .. }
            | Self::Open { .. }
            | Self::MakeFilesystem { .. }
            | Self::Mount { .. }
            | Self::Unmount { .. }
            | Self::CommandFailed { .. }
            | Self::Timeout { .. }
            | Self::Io { .. }
            | Self::System(_) => ErrorKind::Io,
            Self::NotMounted(_) | Self::NotEncrypted { .. } => ErrorKind::StateInconsistency,
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(ContainerError::InvalidSize(0).kind(), ErrorKind::Usage);
        assert_eq!(
            ContainerError::NoDeviceAvailable.kind(),
            ErrorKind::ResourceUnavailable
        );
        assert_eq!(
            ContainerError::WrongCredential {
                device: "/dev/loop0".to_string(),
                reason: "No key available".to_string(),
            }
            .kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            ContainerError::NotMounted(PathBuf::from("/mnt/x")).kind(),
            ErrorKind::StateInconsistency
        );
        assert_eq!(
            ContainerError::Timeout {
                command: "cryptsetup".to_string(),
                after: Duration::from_secs(1),
            }
            .kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResourceUnavailable).expect("serialize kind");
        assert_eq!(json, "\"resource_unavailable\"");
    }

    #[test]
    fn only_interruption_stops_a_batch() {
        assert!(ErrorKind::Interrupted.is_fatal_to_batch());
        assert!(!ErrorKind::StateInconsistency.is_fatal_to_batch());
        assert!(!ErrorKind::Io.is_fatal_to_batch());
    }
}
