// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use cryptbox_types::ContainerError;
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("{0} not found in PATH")]
    BinaryNotFound(String),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("invalid mountinfo line: {0}")]
    InvalidMountInfoLine(String),
}

impl From<SysError> for ContainerError {
    fn from(error: SysError) -> Self {
        match error {
            SysError::Timeout { command, after } => ContainerError::Timeout { command, after },
            SysError::Spawn { command, source } => ContainerError::CommandFailed {
                command,
                stderr: source.to_string(),
            },
            SysError::BinaryNotFound(binary) => {
                ContainerError::Config(format!("{binary} not found in PATH"))
            }
            other => ContainerError::System(other.to_string()),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
