// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Suffix appended to the container path for a generated key file.
pub const KEY_FILE_SUFFIX: &str = ".pw";

/// Secret used to format and open a volume.
///
/// Neither variant carries secret bytes: interactive passphrases are collected
/// by the engine on the terminal, and key files are read by the engine itself.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    Interactive,
    KeyFile(PathBuf),
}

impl Credential {
    pub fn key_file(&self) -> Option<&Path> {
        match self {
            Self::Interactive => None,
            Self::KeyFile(path) => Some(path),
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => f.write_str("Interactive"),
            Self::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => f.write_str("interactive passphrase"),
            Self::KeyFile(path) => write!(f, "key file {}", path.display()),
        }
    }
}

/// `<container>.pw`, next to the container.
pub fn key_file_path_for(container: &Path) -> PathBuf {
    let mut path = OsString::from(container.as_os_str());
    path.push(KEY_FILE_SUFFIX);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_sits_next_to_container() {
        assert_eq!(
            key_file_path_for(Path::new("/srv/box.img")),
            PathBuf::from("/srv/box.img.pw")
        );
    }

    #[test]
    fn display_never_mentions_contents() {
        let credential = Credential::KeyFile(PathBuf::from("/srv/box.img.pw"));
        assert_eq!(credential.to_string(), "key file /srv/box.img.pw");
        assert_eq!(Credential::Interactive.to_string(), "interactive passphrase");
    }
}
