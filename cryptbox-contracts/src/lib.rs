// SPDX-License-Identifier: GPL-3.0-only

pub mod backends;
pub mod traits;

pub use backends::Backends;
pub use traits::{BlockTools, CryptEngine, LoopControl, MountOps};
