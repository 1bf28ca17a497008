// SPDX-License-Identifier: GPL-3.0-only

pub mod block;
pub mod crypt;
pub mod loop_control;
pub mod mount;

pub use block::BlockTools;
pub use crypt::CryptEngine;
pub use loop_control::LoopControl;
pub use mount::MountOps;
