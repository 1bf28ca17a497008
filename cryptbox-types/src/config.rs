// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContainerError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptbox.toml";
pub const DEFAULT_LOCK_FILE: &str = "/run/lock/cryptbox.lock";
pub const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Settings read from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    pub filesystem: String,
    pub luks_type: String,
    pub cipher: Option<String>,
    pub key_size: Option<u32>,
    pub hash: Option<String>,
    pub key_file_bytes: usize,
    pub command_timeout_secs: u64,
    pub loop_device_limit: u32,
    pub lock_file: Option<PathBuf>,
    pub mapper_dir: PathBuf,
    pub cryptsetup_path: Option<PathBuf>,
    pub log_level: LoggingLevel,
    pub log_file: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            filesystem: "ext4".to_string(),
            luks_type: "luks2".to_string(),
            cipher: None,
            key_size: None,
            hash: None,
            key_file_bytes: 512,
            command_timeout_secs: 300,
            loop_device_limit: 256,
            lock_file: Some(PathBuf::from(DEFAULT_LOCK_FILE)),
            mapper_dir: PathBuf::from(DEFAULT_MAPPER_DIR),
            cryptsetup_path: None,
            log_level: LoggingLevel::default(),
            log_file: None,
        }
    }
}

impl ContainerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            ContainerError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::parse(&raw)
            .map_err(|reason| ContainerError::Config(format!("{}: {reason}", path.display())))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mut config: Self = toml::from_str(raw).map_err(|error| error.to_string())?;
        // An empty lock path disables allocation locking.
        if config
            .lock_file
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            config.lock_file = None;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.filesystem.is_empty()
            || !self
                .filesystem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!("invalid filesystem type '{}'", self.filesystem));
        }
        if self.luks_type != "luks1" && self.luks_type != "luks2" {
            return Err(format!(
                "luks_type must be 'luks1' or 'luks2' (got '{}')",
                self.luks_type
            ));
        }
        if self.key_file_bytes < 64 {
            return Err("key_file_bytes must be at least 64".to_string());
        }
        if self.command_timeout_secs == 0 {
            return Err("command_timeout_secs must be positive".to_string());
        }
        if self.loop_device_limit == 0 {
            return Err("loop_device_limit must be positive".to_string());
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Immutable per-invocation configuration: file settings plus command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub settings: ContainerConfig,
    pub debug: bool,
    pub verbose: bool,
    pub force: bool,
}

impl RuntimeConfig {
    pub fn new(settings: ContainerConfig) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, debug: bool, verbose: bool, force: bool) -> Self {
        self.debug = debug;
        self.verbose = verbose;
        self.force = force;
        self
    }

    pub fn log_level(&self) -> LoggingLevel {
        if self.debug {
            LoggingLevel::Debug
        } else if self.verbose {
            LoggingLevel::Info
        } else {
            self.settings.log_level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ContainerConfig::parse("").expect("parse empty config");
        assert_eq!(config, ContainerConfig::default());
    }

    #[test]
    fn overrides_selected_keys() {
        let config = ContainerConfig::parse(
            "filesystem = \"xfs\"\nkey_file_bytes = 1024\nlog_level = \"debug\"\n",
        )
        .expect("parse config");
        assert_eq!(config.filesystem, "xfs");
        assert_eq!(config.key_file_bytes, 1024);
        assert_eq!(config.log_level, LoggingLevel::Debug);
        assert_eq!(config.luks_type, "luks2");
    }

    #[test]
    fn empty_lock_file_disables_locking() {
        let config = ContainerConfig::parse("lock_file = \"\"\n").expect("parse config");
        assert!(config.lock_file.is_none());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(ContainerConfig::parse("colour = \"blue\"\n").is_err());
        assert!(ContainerConfig::parse("luks_type = \"plain\"\n").is_err());
        assert!(ContainerConfig::parse("filesystem = \"ext4; rm\"\n").is_err());
        assert!(ContainerConfig::parse("key_file_bytes = 8\n").is_err());
    }

    #[test]
    fn load_reports_missing_file_as_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = ContainerConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(error, ContainerError::Config(_)));
    }

    #[test]
    fn flags_take_precedence_for_log_level() {
        let runtime = RuntimeConfig::default().with_flags(false, true, false);
        assert_eq!(runtime.log_level(), LoggingLevel::Info);
        let runtime = RuntimeConfig::default().with_flags(true, true, false);
        assert_eq!(runtime.log_level(), LoggingLevel::Debug);
        assert_eq!(RuntimeConfig::default().log_level(), LoggingLevel::Warn);
    }
}
