// SPDX-License-Identifier: GPL-3.0-only

//! Lifecycle management for LUKS-encrypted container files
//!
//! A container is a plain file holding a LUKS volume. Using one takes a chain
//! of kernel resources:
//!
//! - [`DeviceAllocator`] → loopback device bound to the file
//! - [`EncryptedVolume`] → decrypted device-mapper mapping on that device
//! - [`MountController`] → filesystem mounted from the mapping
//!
//! [`Lifecycle`] sequences them for `create`, `mount`, `unmount` and `status`.

pub mod allocator;
pub mod config;
pub mod interrupt;
pub mod lifecycle;
pub mod logging;
pub mod mount;
pub mod rollback;
pub mod volume;

pub use allocator::DeviceAllocator;
pub use interrupt::Interrupt;
pub use lifecycle::{
    BatchOutcome, CreateOutcome, CreateRequest, Lifecycle, MountOutcome, MountRequest,
    UnmountOutcome,
};
pub use mount::MountController;
pub use rollback::RollbackScope;
pub use volume::EncryptedVolume;
