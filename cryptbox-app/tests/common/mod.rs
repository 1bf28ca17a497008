// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use cryptbox::{CreateOutcome, CreateRequest, Interrupt, Lifecycle, MountOutcome, MountRequest};
use cryptbox_testing::SimHost;
use cryptbox_types::{ContainerConfig, Credential, RuntimeConfig, key_file_path_for};
use tempfile::TempDir;

pub const SIZE_MIB: u64 = 2;

/// A simulated host plus a scratch directory for container files.
pub struct Fixture {
    pub dir: TempDir,
    pub host: SimHost,
    pub lifecycle: Lifecycle,
    pub runtime: RuntimeConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_host(SimHost::default())
    }

    pub fn with_host(host: SimHost) -> Self {
        let settings = ContainerConfig {
            lock_file: None,
            mapper_dir: host.mapper_dir(),
            ..ContainerConfig::default()
        };
        Self {
            dir: tempfile::tempdir().expect("create scratch dir"),
            lifecycle: Lifecycle::new(host.backends(), Interrupt::new()),
            host,
            runtime: RuntimeConfig::new(settings),
        }
    }

    pub fn forced(mut self) -> Self {
        self.runtime.force = true;
        self
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn mount_dir(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        fs::create_dir_all(&path).expect("create mount point");
        path
    }

    pub fn create_with_key(&self, name: &str) -> CreateOutcome {
        let request = CreateRequest::from_mib(self.path(name), SIZE_MIB, true).expect("request");
        self.lifecycle
            .create(&self.runtime, &request)
            .expect("create container")
    }

    pub fn mount_with_key(&self, container: &Path, mount_point: &Path) -> MountOutcome {
        let request = MountRequest {
            container: container.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            credential: Credential::KeyFile(key_file_path_for(container)),
        };
        self.lifecycle
            .mount(&self.runtime, &request)
            .expect("mount container")
    }

    /// Verbs recorded since `mark`.
    pub fn verbs_since(&self, mark: usize) -> Vec<String> {
        self.host.verbs().split_off(mark)
    }
}

pub fn assert_clean(host: &SimHost, label: &str) {
    let snapshot = host.snapshot(label);
    assert!(snapshot.is_clean(), "{label}: host not clean: {snapshot:?}");
}
