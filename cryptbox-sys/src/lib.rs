// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for encrypted containers
//!
//! This crate implements the backend traits against the running host:
//! - Loop devices through the kernel loop ioctls and sysfs
//! - The `cryptsetup` engine, run with a timeout
//! - Zero fill and `mkfs.<type>` on decrypted mappings
//! - `mount(2)`/`umount2(2)` and `/proc/self/mountinfo`
//! - Container and key files, and the allocation lock
//!
//! Most operations require root.

pub mod block;
pub mod cmd;
pub mod cryptsetup;
pub mod error;
pub mod lock;
pub mod loop_device;
pub mod mounts;
pub mod store;

use std::sync::Arc;

use cryptbox_contracts::Backends;
use cryptbox_types::ContainerConfig;

pub use block::{SystemBlockTools, zero_fill};
pub use cmd::{CommandOutput, CommandRunner};
pub use cryptsetup::{Cryptsetup, parse_status};
pub use error::{Result, SysError};
pub use lock::AllocationLock;
pub use loop_device::KernelLoopControl;
pub use mounts::{SystemMounts, parse_mountinfo};
pub use store::ContainerStore;

/// Backends bound to the real host, configured from `config`.
pub fn system_backends(config: &ContainerConfig) -> Result<Backends> {
    let runner = CommandRunner::new(config.command_timeout());
    let crypt = Cryptsetup::from_config(config)?;
    Ok(Backends::new(
        Arc::new(KernelLoopControl::new(config.loop_device_limit)),
        Arc::new(crypt),
        Arc::new(SystemBlockTools::new(runner)),
        Arc::new(SystemMounts::new(&config.mapper_dir)),
    ))
}

pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}
