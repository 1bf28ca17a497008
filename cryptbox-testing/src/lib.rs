// SPDX-License-Identifier: GPL-3.0-only

//! Test support for cryptbox
//!
//! [`SimHost`] is an in-memory loop, mapper and mount table implementing every
//! backend contract, so lifecycle sequences can be exercised without root.
//! [`HostSnapshot`] records what a host still holds after a run.

pub mod errors;
pub mod ledger;
pub mod sim;
pub mod support;

pub use errors::{Result, TestingError};
pub use ledger::HostSnapshot;
pub use sim::{SimHost, SimOp};
