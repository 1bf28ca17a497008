// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use cryptbox_types::{LoopDevice, LoopState, Result};

/// Kernel loopback table.
pub trait LoopControl: Send + Sync {
    /// Existing loop nodes in ascending index order.
    fn candidates(&self) -> Result<Vec<LoopDevice>>;

    /// Non-destructive probe of a node's binding state.
    fn probe(&self, device: &LoopDevice) -> Result<LoopState>;

    /// Bind `backing` to `device`; fails with `Bind` if the node is already taken.
    fn bind(&self, device: &LoopDevice, backing: &Path) -> Result<()>;

    /// Detach whatever is bound to `device`. Already-free nodes succeed.
    fn unbind(&self, device: &LoopDevice) -> Result<()>;

    /// Ask the platform for a fresh free node, when it offers a control interface.
    fn request_free(&self) -> Result<Option<LoopDevice>> {
        Ok(None)
    }
}
