// SPDX-License-Identifier: GPL-3.0-only

//! Gates for tests that touch real loop devices and mappings

use std::path::{Path, PathBuf};

use crate::errors::{Result, TestingError};

pub const DESTRUCTIVE_ENV: &str = "CRYPTBOX_TESTING_ENABLE_DESTRUCTIVE";
/// Directory that keeps host snapshots after a destructive run.
pub const LEDGER_DIR_ENV: &str = "CRYPTBOX_TESTING_LEDGER_DIR";

pub fn skip<T>(reason: impl Into<String>) -> Result<T> {
    Err(TestingError::TestSkipped {
        reason: reason.into(),
    })
}

pub fn env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn destructive_enabled() -> bool {
    env(DESTRUCTIVE_ENV).as_deref() == Some("1")
}

/// `Ok` only when destructive tests are enabled and the caller is root.
pub fn require_destructive(label: &str, privileged: bool) -> Result<()> {
    if !destructive_enabled() {
        return skip(format!("destructive test disabled for {label}"));
    }
    if !privileged {
        return Err(TestingError::PrivilegeRequired);
    }
    Ok(())
}

/// `$CRYPTBOX_TESTING_LEDGER_DIR`, else `fallback`.
pub fn ledger_dir(fallback: &Path) -> PathBuf {
    env(LEDGER_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf())
}
