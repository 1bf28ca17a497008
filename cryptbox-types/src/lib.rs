// SPDX-License-Identifier: GPL-3.0-only

//! Domain models shared by every cryptbox crate
//!
//! The resource chain of an encrypted container is modelled here:
//!
//! - `LoopDevice` → loopback node bound to the container file
//! - `MappingName` / `MappingStatus` → decrypted device-mapper mapping
//! - `MountEntry` / `Resolution` → live mount and the chain recovered from it
//!
//! `ContainerError` and its `ErrorKind` categories are the single error
//! vocabulary across the backends and the lifecycle layer.

pub mod config;
pub mod credential;
pub mod device;
pub mod error;
pub mod mapping;
pub mod mount;

pub use config::{ContainerConfig, LoggingLevel, RuntimeConfig};
pub use credential::{Credential, KEY_FILE_SUFFIX, key_file_path_for};
pub use device::{LoopDevice, LoopState, parse_loop_index};
pub use error::{ContainerError, ErrorKind, Result};
pub use mapping::{FormatOptions, MappingName, MappingState, MappingStatus};
pub use mount::{MountEntry, Resolution};
