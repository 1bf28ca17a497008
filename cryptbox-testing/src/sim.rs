// SPDX-License-Identifier: GPL-3.0-only

//! In-memory host implementing every backend contract
//!
//! Container and key files are real files (callers use temp dirs); loop
//! bindings, LUKS headers, mappings, filesystems and mounts live in a shared
//! table. Every successful call is appended to an ordered event log.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use cryptbox_contracts::{Backends, BlockTools, CryptEngine, LoopControl, MountOps};
use cryptbox_types::{
    ContainerError, Credential, FormatOptions, LoopDevice, LoopState, MappingName, MappingState,
    MappingStatus, MountEntry, Result,
};
use tracing::debug;

use crate::ledger::HostSnapshot;

/// Backend calls that faults and hooks can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Candidates,
    Probe,
    Bind,
    Unbind,
    RequestFree,
    Format,
    Open,
    Close,
    Status,
    Wipe,
    MakeFilesystem,
    Mount,
    Unmount,
    MountedAt,
}

const WIPE_STEP: u64 = 1024 * 1024;

type Fault = Box<dyn FnOnce() -> ContainerError + Send>;
type Hook = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone)]
struct MappingRecord {
    device: PathBuf,
    backing: PathBuf,
}

struct HostState {
    loop_dir: PathBuf,
    mapper_dir: PathBuf,
    /// Node index → bound backing file.
    loops: BTreeMap<u32, Option<PathBuf>>,
    loop_control: bool,
    /// Backing file → secret the header was formatted with.
    headers: HashMap<PathBuf, Vec<u8>>,
    /// Backing file → filesystem type.
    filesystems: HashMap<PathBuf, String>,
    mappings: BTreeMap<String, MappingRecord>,
    mounts: BTreeMap<PathBuf, MountEntry>,
    busy_targets: Vec<PathBuf>,
    passphrase: Option<String>,
    faults: HashMap<SimOp, VecDeque<Fault>>,
    hooks: HashMap<SimOp, Vec<Hook>>,
    events: Vec<String>,
}

impl HostState {
    fn fault(&mut self, op: SimOp) -> Result<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(fault) => {
                debug!("Injecting fault into {:?}", op);
                Err(fault())
            }
            None => Ok(()),
        }
    }

    fn loop_index(&self, device: &LoopDevice) -> Result<u32> {
        if self.loops.contains_key(&device.index()) {
            Ok(device.index())
        } else {
            Err(ContainerError::io(
                device.path(),
                io::Error::from(io::ErrorKind::NotFound),
            ))
        }
    }

    /// Backing file of a bound loop node given by path.
    fn backing_of(&self, device: &Path) -> Option<PathBuf> {
        let index = LoopDevice::from_path(device)?.index();
        self.loops.get(&index).cloned().flatten()
    }

    fn mapping_for_device(&self, device: &Path) -> Option<(&String, &MappingRecord)> {
        let name = device.strip_prefix(&self.mapper_dir).ok()?.to_str()?;
        self.mappings.get_key_value(name)
    }

    fn secret(&self, credential: &Credential) -> std::result::Result<Vec<u8>, String> {
        match credential {
            Credential::KeyFile(path) => {
                fs::read(path).map_err(|error| format!("cannot read {}: {error}", path.display()))
            }
            Credential::Interactive => self
                .passphrase
                .as_ref()
                .map(|phrase| phrase.as_bytes().to_vec())
                .ok_or_else(|| "no passphrase entered".to_string()),
        }
    }

    fn record(&mut self, event: String) {
        debug!("sim: {}", event);
        self.events.push(event);
    }
}

/// Shared simulated host; clones observe the same state.
#[derive(Clone)]
pub struct SimHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(8)
    }
}

impl SimHost {
    /// A host with `loop_nodes` free loop devices and no loop-control node.
    pub fn new(loop_nodes: u32) -> Self {
        let state = HostState {
            loop_dir: PathBuf::from("/dev"),
            mapper_dir: PathBuf::from("/dev/mapper"),
            loops: (0..loop_nodes).map(|index| (index, None)).collect(),
            loop_control: false,
            headers: HashMap::new(),
            filesystems: HashMap::new(),
            mappings: BTreeMap::new(),
            mounts: BTreeMap::new(),
            busy_targets: Vec::new(),
            passphrase: None,
            faults: HashMap::new(),
            hooks: HashMap::new(),
            events: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn backends(&self) -> Backends {
        Backends::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub fn mapper_dir(&self) -> PathBuf {
        self.lock().mapper_dir.clone()
    }

    /// Let `request_free` create new nodes past the scanned range.
    pub fn with_loop_control(self) -> Self {
        self.lock().loop_control = true;
        self
    }

    /// Passphrase the user "types" at interactive prompts.
    pub fn set_passphrase(&self, passphrase: impl Into<String>) {
        self.lock().passphrase = Some(passphrase.into());
    }

    /// Bind a node to `backing` behind the lifecycle's back.
    pub fn occupy(&self, index: u32, backing: impl Into<PathBuf>) {
        self.lock().loops.insert(index, Some(backing.into()));
    }

    /// A mount that did not come from an encrypted mapping.
    pub fn add_foreign_mount(&self, source: &str, target: impl Into<PathBuf>, fs_type: &str) {
        let target = target.into();
        self.lock().mounts.insert(
            target.clone(),
            MountEntry {
                source: source.to_string(),
                target,
                fs_type: fs_type.to_string(),
            },
        );
    }

    /// Make `unmount(target)` fail with `Busy`.
    pub fn mark_busy(&self, target: impl Into<PathBuf>) {
        self.lock().busy_targets.push(target.into());
    }

    /// Fail the next call of `op` with the error `make` builds.
    pub fn fail_next<F>(&self, op: SimOp, make: F)
    where
        F: FnOnce() -> ContainerError + Send + 'static,
    {
        self.lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(Box::new(make));
    }

    /// Run `hook` after every successful call of `op`.
    pub fn after<F>(&self, op: SimOp, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.lock().hooks.entry(op).or_default().push(Box::new(hook));
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    /// Event verbs in order, e.g. `["bind", "format", "open"]`.
    pub fn verbs(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| event.split_whitespace().next().map(str::to_string))
            .collect()
    }

    pub fn bound_loops(&self) -> Vec<(u32, PathBuf)> {
        self.lock()
            .loops
            .iter()
            .filter_map(|(index, backing)| backing.clone().map(|backing| (*index, backing)))
            .collect()
    }

    pub fn open_mappings(&self) -> Vec<String> {
        self.lock().mappings.keys().cloned().collect()
    }

    pub fn is_formatted(&self, backing: &Path) -> bool {
        self.lock().headers.contains_key(backing)
    }

    pub fn filesystem_on(&self, backing: &Path) -> Option<String> {
        self.lock().filesystems.get(backing).cloned()
    }

    pub fn snapshot(&self, label: &str) -> HostSnapshot {
        let state = self.lock();
        let mut snapshot = HostSnapshot::new(label);
        snapshot.loop_devices = state
            .loops
            .iter()
            .filter_map(|(index, backing)| {
                backing.as_ref().map(|backing| {
                    format!(
                        "{} -> {}",
                        state.loop_dir.join(format!("loop{index}")).display(),
                        backing.display()
                    )
                })
            })
            .collect();
        snapshot.open_mappings = state.mappings.keys().cloned().collect();
        snapshot.mount_points = state
            .mounts
            .keys()
            .map(|target| target.display().to_string())
            .collect();
        snapshot
    }

    /// Run the fault check, the operation and, on success, the hooks.
    ///
    /// Hooks run with the state unlocked so they may call back into the host.
    fn call<T>(&self, op: SimOp, body: impl FnOnce(&mut HostState) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = self.lock();
            state.fault(op).and_then(|()| body(&mut state))
        };
        if result.is_ok() {
            let mut hooks = self.lock().hooks.remove(&op).unwrap_or_default();
            for hook in &mut hooks {
                hook();
            }
            let mut state = self.lock();
            let slot = state.hooks.entry(op).or_default();
            hooks.append(slot);
            *slot = hooks;
        }
        result
    }
}

impl LoopControl for SimHost {
    fn candidates(&self) -> Result<Vec<LoopDevice>> {
        self.call(SimOp::Candidates, |state| {
            Ok(state
                .loops
                .keys()
                .map(|index| {
                    LoopDevice::with_path(*index, state.loop_dir.join(format!("loop{index}")))
                })
                .collect())
        })
    }

    fn probe(&self, device: &LoopDevice) -> Result<LoopState> {
        self.call(SimOp::Probe, |state| {
            let index = state.loop_index(device)?;
            Ok(match state.loops.get(&index).cloned().flatten() {
                Some(backing) => LoopState::Bound {
                    backing: Some(backing),
                },
                None => LoopState::Free,
            })
        })
    }

    fn bind(&self, device: &LoopDevice, backing: &Path) -> Result<()> {
        self.call(SimOp::Bind, |state| {
            let index = state.loop_index(device)?;
            if !backing.is_file() {
                return Err(ContainerError::io(
                    backing,
                    io::Error::from(io::ErrorKind::NotFound),
                ));
            }
            if state.loops.get(&index).cloned().flatten().is_some() {
                return Err(ContainerError::Bind {
                    device: device.to_string(),
                    backing: backing.to_path_buf(),
                    reason: "device was bound by another process".to_string(),
                });
            }
            state.loops.insert(index, Some(backing.to_path_buf()));
            state.record(format!("bind {} {}", device, backing.display()));
            Ok(())
        })
    }

    fn unbind(&self, device: &LoopDevice) -> Result<()> {
        self.call(SimOp::Unbind, |state| {
            let index = state.loop_index(device)?;
            if state.loops.get(&index).cloned().flatten().is_none() {
                return Ok(());
            }
            if state
                .mappings
                .values()
                .any(|mapping| mapping.device == device.path())
            {
                return Err(ContainerError::busy(
                    device.to_string(),
                    "loop device is still in use",
                ));
            }
            state.loops.insert(index, None);
            state.record(format!("unbind {device}"));
            Ok(())
        })
    }

    fn request_free(&self) -> Result<Option<LoopDevice>> {
        self.call(SimOp::RequestFree, |state| {
            if !state.loop_control {
                return Ok(None);
            }
            let index = state.loops.keys().next_back().map_or(0, |last| last + 1);
            state.loops.insert(index, None);
            Ok(Some(LoopDevice::with_path(
                index,
                state.loop_dir.join(format!("loop{index}")),
            )))
        })
    }
}

impl CryptEngine for SimHost {
    fn format(
        &self,
        device: &Path,
        credential: &Credential,
        _options: &FormatOptions,
    ) -> Result<()> {
        self.call(SimOp::Format, |state| {
            let format_error = |reason: String| ContainerError::Format {
                device: device.display().to_string(),
                reason,
            };
            let backing = state
                .backing_of(device)
                .ok_or_else(|| format_error("device is not bound".to_string()))?;
            let secret = state.secret(credential).map_err(format_error)?;
            state.headers.insert(backing.clone(), secret);
            state.filesystems.remove(&backing);
            state.record(format!("format {}", device.display()));
            Ok(())
        })
    }

    fn open(&self, device: &Path, credential: &Credential, name: &MappingName) -> Result<()> {
        self.call(SimOp::Open, |state| {
            let open_error = |reason: &str| ContainerError::Open {
                device: device.display().to_string(),
                name: name.to_string(),
                reason: reason.to_string(),
            };
            if state.mappings.contains_key(name.as_str()) {
                return Err(open_error("a mapping with this name is already active"));
            }
            let backing = state
                .backing_of(device)
                .ok_or_else(|| open_error("device is not bound"))?;
            let header = state
                .headers
                .get(&backing)
                .ok_or_else(|| open_error("not a valid LUKS device"))?;
            let secret = state.secret(credential).map_err(|reason| open_error(&reason))?;
            if *header != secret {
                return Err(ContainerError::WrongCredential {
                    device: device.display().to_string(),
                    reason: "No key available with this passphrase.".to_string(),
                });
            }
            state.mappings.insert(
                name.to_string(),
                MappingRecord {
                    device: device.to_path_buf(),
                    backing,
                },
            );
            state.record(format!("open {} {}", device.display(), name));
            Ok(())
        })
    }

    fn close(&self, name: &MappingName) -> Result<()> {
        self.call(SimOp::Close, |state| {
            if !state.mappings.contains_key(name.as_str()) {
                return Ok(());
            }
            let device = name.device_path(&state.mapper_dir);
            if state
                .mounts
                .values()
                .any(|entry| Path::new(&entry.source) == device)
            {
                return Err(ContainerError::busy(
                    format!("mapping {name}"),
                    "Device is still in use.",
                ));
            }
            state.mappings.remove(name.as_str());
            state.record(format!("close {name}"));
            Ok(())
        })
    }

    fn status(&self, name: &MappingName) -> Result<MappingStatus> {
        self.call(SimOp::Status, |state| {
            Ok(match state.mappings.get(name.as_str()) {
                Some(mapping) => MappingStatus {
                    name: name.clone(),
                    state: MappingState::Active,
                    backing_device: Some(mapping.device.clone()),
                    kind: Some("LUKS2".to_string()),
                },
                None => MappingStatus::inactive(name.clone()),
            })
        })
    }
}

impl BlockTools for SimHost {
    /// Reports progress per MiB of the backing file with the host locked, so
    /// `progress` must not call back into the host.
    fn wipe(&self, device: &Path, progress: &mut dyn FnMut(u64) -> Result<()>) -> Result<u64> {
        self.call(SimOp::Wipe, |state| {
            let (_, mapping) = state.mapping_for_device(device).ok_or_else(|| {
                ContainerError::io(device, io::Error::from(io::ErrorKind::NotFound))
            })?;
            let size = fs::metadata(&mapping.backing)
                .map(|meta| meta.len())
                .map_err(|error| ContainerError::io(&mapping.backing, error))?;
            let mut done = 0;
            while done < size {
                done = (done + WIPE_STEP).min(size);
                progress(done)?;
            }
            state.record(format!("wipe {}", device.display()));
            Ok(size)
        })
    }

    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<()> {
        self.call(SimOp::MakeFilesystem, |state| {
            let backing = state
                .mapping_for_device(device)
                .map(|(_, mapping)| mapping.backing.clone())
                .ok_or_else(|| ContainerError::MakeFilesystem {
                    fs_type: fs_type.to_string(),
                    device: device.display().to_string(),
                    reason: "no such device".to_string(),
                })?;
            state.filesystems.insert(backing, fs_type.to_string());
            state.record(format!("mkfs {} {}", fs_type, device.display()));
            Ok(())
        })
    }
}

impl MountOps for SimHost {
    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<()> {
        self.call(SimOp::Mount, |state| {
            let mount_error = |reason: &str| ContainerError::Mount {
                device: device.display().to_string(),
                target: target.to_path_buf(),
                reason: reason.to_string(),
            };
            let backing = state
                .mapping_for_device(device)
                .map(|(_, mapping)| mapping.backing.clone())
                .ok_or_else(|| mount_error("No such device"))?;
            if state.filesystems.get(&backing).map(String::as_str) != Some(fs_type) {
                return Err(mount_error("wrong fs type, bad option, bad superblock"));
            }
            if state.mounts.contains_key(target) {
                return Err(mount_error("Device or resource busy"));
            }
            state.mounts.insert(
                target.to_path_buf(),
                MountEntry {
                    source: device.display().to_string(),
                    target: target.to_path_buf(),
                    fs_type: fs_type.to_string(),
                },
            );
            state.record(format!("mount {} {}", device.display(), target.display()));
            Ok(())
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.call(SimOp::Unmount, |state| {
            if state.busy_targets.iter().any(|busy| busy == target) {
                return Err(ContainerError::busy(
                    target.display().to_string(),
                    "target is busy",
                ));
            }
            if state.mounts.remove(target).is_none() {
                return Err(ContainerError::NotMounted(target.to_path_buf()));
            }
            state.record(format!("unmount {}", target.display()));
            Ok(())
        })
    }

    fn mounted_at(&self, target: &Path) -> Result<Option<MountEntry>> {
        self.call(SimOp::MountedAt, |state| Ok(state.mounts.get(target).cloned()))
    }
}
