// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use crate::traits::{BlockTools, CryptEngine, LoopControl, MountOps};

/// The set of backends a lifecycle runs against.
#[derive(Clone)]
pub struct Backends {
    loops: Arc<dyn LoopControl>,
    crypt: Arc<dyn CryptEngine>,
    block: Arc<dyn BlockTools>,
    mounts: Arc<dyn MountOps>,
}

impl Backends {
    pub fn new(
        loops: Arc<dyn LoopControl>,
        crypt: Arc<dyn CryptEngine>,
        block: Arc<dyn BlockTools>,
        mounts: Arc<dyn MountOps>,
    ) -> Self {
        Self {
            loops,
            crypt,
            block,
            mounts,
        }
    }

    pub fn loops(&self) -> Arc<dyn LoopControl> {
        self.loops.clone()
    }

    pub fn crypt(&self) -> Arc<dyn CryptEngine> {
        self.crypt.clone()
    }

    pub fn block(&self) -> Arc<dyn BlockTools> {
        self.block.clone()
    }

    pub fn mounts(&self) -> Arc<dyn MountOps> {
        self.mounts.clone()
    }
}
