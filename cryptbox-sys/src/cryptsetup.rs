// SPDX-License-Identifier: GPL-3.0-only

//! `cryptsetup` adapter
//!
//! All knowledge of the tool's arguments, exit codes and output text lives
//! here; callers only see [`CryptEngine`] results.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use cryptbox_contracts::CryptEngine;
use cryptbox_types::{
    ContainerError, ContainerConfig, Credential, FormatOptions, MappingName, MappingState,
    MappingStatus, Result,
};
use tracing::{debug, info};

use crate::cmd::{CommandOutput, CommandRunner, args};
use crate::error::SysError;

/// `cryptsetup` exit code for a wrong passphrase or key.
const EXIT_WRONG_KEY: i32 = 2;
/// Exit code for a wrong device or an inactive mapping.
const EXIT_NO_DEVICE: i32 = 4;
/// Exit code for a device that is in use.
const EXIT_BUSY: i32 = 5;

pub struct Cryptsetup {
    binary: PathBuf,
    runner: CommandRunner,
}

impl Cryptsetup {
    pub fn new(binary: PathBuf, runner: CommandRunner) -> Self {
        Self { binary, runner }
    }

    /// Use the configured binary, or find `cryptsetup` on `PATH`.
    pub fn from_config(config: &ContainerConfig) -> std::result::Result<Self, SysError> {
        let binary = match &config.cryptsetup_path {
            Some(path) => path.clone(),
            None => which::which("cryptsetup")
                .map_err(|_| SysError::BinaryNotFound("cryptsetup".to_string()))?,
        };
        Ok(Self::new(
            binary,
            CommandRunner::new(config.command_timeout()),
        ))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn run(&self, args: &[OsString], credential: &Credential) -> Result<CommandOutput> {
        let output = if credential.is_interactive() {
            self.runner.run_interactive(&self.binary, args)?
        } else {
            self.runner.run(&self.binary, args)?
        };
        Ok(output)
    }
}

fn credential_args(credential: &Credential) -> Vec<OsString> {
    match credential.key_file() {
        Some(path) => args([
            OsString::from("--batch-mode"),
            OsString::from("--key-file"),
            path.as_os_str().to_os_string(),
        ]),
        None => Vec::new(),
    }
}

impl CryptEngine for Cryptsetup {
    fn format(
        &self,
        device: &Path,
        credential: &Credential,
        options: &FormatOptions,
    ) -> Result<()> {
        let mut argv = args(["luksFormat", "--type", options.luks_type.as_str()]);
        if let Some(cipher) = &options.cipher {
            argv.extend(args(["--cipher", cipher.as_str()]));
        }
        if let Some(key_size) = options.key_size {
            argv.extend(args(["--key-size".to_string(), key_size.to_string()]));
        }
        if let Some(hash) = &options.hash {
            argv.extend(args(["--hash", hash.as_str()]));
        }
        argv.extend(credential_args(credential));
        argv.push(device.as_os_str().to_os_string());

        info!("Formatting {} with {}", device.display(), credential);
        let output = self.run(&argv, credential)?;
        if output.success() {
            return Ok(());
        }
        Err(ContainerError::Format {
            device: device.display().to_string(),
            reason: failure_reason(&output),
        })
    }

    fn open(&self, device: &Path, credential: &Credential, name: &MappingName) -> Result<()> {
        if self.status(name)?.is_active() {
            return Err(ContainerError::Open {
                device: device.display().to_string(),
                name: name.to_string(),
                reason: "a mapping with this name is already active".to_string(),
            });
        }

        let mut argv = args(["open", "--type", "luks"]);
        argv.extend(credential_args(credential));
        argv.push(device.as_os_str().to_os_string());
        argv.push(OsString::from(name.as_str()));

        info!("Opening {} as {}", device.display(), name);
        let output = self.run(&argv, credential)?;
        if output.success() {
            return Ok(());
        }
        Err(classify_open_failure(device, name, &output))
    }

    fn close(&self, name: &MappingName) -> Result<()> {
        let argv = args(["close", name.as_str()]);
        let output = self.runner.run(&self.binary, &argv)?;
        if output.success() {
            return Ok(());
        }
        classify_close_failure(name, &output)
    }

    fn status(&self, name: &MappingName) -> Result<MappingStatus> {
        let argv = args(["status", name.as_str()]);
        let output = self.runner.run(&self.binary, &argv)?;
        classify_status(name, &output)
    }
}

fn failure_reason(output: &CommandOutput) -> String {
    if output.stdout.is_empty() && output.stderr.is_empty() {
        // Interactive runs print straight to the terminal.
        format!("{} exited with code {}", output.command, output.status)
    } else {
        format!("{} (exit code {})", output.diagnostic(), output.status)
    }
}

fn is_authentication_failure(lower: &str) -> bool {
    lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}

pub(crate) fn classify_open_failure(
    device: &Path,
    name: &MappingName,
    output: &CommandOutput,
) -> ContainerError {
    let lower = output.diagnostic().to_ascii_lowercase();
    if output.status == EXIT_WRONG_KEY || is_authentication_failure(&lower) {
        return ContainerError::WrongCredential {
            device: device.display().to_string(),
            reason: failure_reason(output),
        };
    }
    ContainerError::Open {
        device: device.display().to_string(),
        name: name.to_string(),
        reason: failure_reason(output),
    }
}

pub(crate) fn classify_close_failure(name: &MappingName, output: &CommandOutput) -> Result<()> {
    let lower = output.diagnostic().to_ascii_lowercase();
    if lower.contains("does not exist")
        || lower.contains("doesn't exist")
        || lower.contains("not active")
        || lower.contains("is inactive")
    {
        debug!("Mapping {} already closed", name);
        return Ok(());
    }
    if output.status == EXIT_BUSY || lower.contains("busy") || lower.contains("in use") {
        return Err(ContainerError::busy(
            format!("mapping {name}"),
            output.diagnostic(),
        ));
    }
    Err(ContainerError::CommandFailed {
        command: output.command.clone(),
        stderr: failure_reason(output),
    })
}

pub(crate) fn classify_status(name: &MappingName, output: &CommandOutput) -> Result<MappingStatus> {
    if output.status == 0 {
        return Ok(parse_status(name, &output.stdout));
    }
    let lower = output.diagnostic().to_ascii_lowercase();
    if output.status == EXIT_NO_DEVICE
        || lower.contains("is inactive")
        || lower.contains("not active")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
    {
        return Ok(MappingStatus::inactive(name.clone()));
    }
    Err(ContainerError::CommandFailed {
        command: output.command.clone(),
        stderr: failure_reason(output),
    })
}

/// Parse the `key: value` lines printed for an active mapping.
///
/// ```text
/// /dev/mapper/box.img is active and is in use.
///   type:    LUKS2
///   cipher:  aes-xts-plain64
///   device:  /dev/loop3
/// ```
pub fn parse_status(name: &MappingName, stdout: &str) -> MappingStatus {
    let mut status = MappingStatus {
        name: name.clone(),
        state: MappingState::Active,
        backing_device: None,
        kind: None,
    };
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "type" => status.kind = Some(value.to_string()),
            "device" => status.backing_device = Some(PathBuf::from(value)),
            _ => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            command: "cryptsetup test".to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
        }
    }

    fn name() -> MappingName {
        MappingName::new("box.img").expect("valid name")
    }

    #[test]
    fn parses_active_status() {
        let stdout = "/dev/mapper/box.img is active and is in use.\n  type:    LUKS2\n  cipher:  aes-xts-plain64\n  keysize: 512 bits\n  device:  /dev/loop3\n  loop:    /srv/box.img\n  mode:    read/write\n";
        let status = parse_status(&name(), stdout);
        assert!(status.is_active());
        assert_eq!(status.kind.as_deref(), Some("LUKS2"));
        assert_eq!(status.backing_device, Some(PathBuf::from("/dev/loop3")));
    }

    #[test]
    fn exit_four_means_inactive() {
        let status = classify_status(&name(), &output(4, "", "")).expect("inactive");
        assert!(!status.is_active());
        let status = classify_status(
            &name(),
            &output(1, "/dev/mapper/box.img is inactive.", ""),
        )
        .expect("inactive");
        assert!(!status.is_active());
    }

    #[test]
    fn unexpected_status_failure_is_an_error() {
        let error = classify_status(&name(), &output(1, "", "Cannot initialize device-mapper"))
            .unwrap_err();
        assert!(matches!(error, ContainerError::CommandFailed { .. }));
    }

    #[test]
    fn wrong_key_is_authentication() {
        let device = Path::new("/dev/loop0");
        let error = classify_open_failure(
            device,
            &name(),
            &output(2, "", "No key available with this passphrase."),
        );
        assert!(matches!(error, ContainerError::WrongCredential { .. }));

        let error = classify_open_failure(device, &name(), &output(1, "", "wrong key"));
        assert!(matches!(error, ContainerError::WrongCredential { .. }));
    }

    #[test]
    fn other_open_failures_are_open_errors() {
        let error = classify_open_failure(
            Path::new("/dev/loop0"),
            &name(),
            &output(1, "", "Device /dev/loop0 is not a valid LUKS device."),
        );
        assert!(matches!(error, ContainerError::Open { .. }));
    }

    #[test]
    fn closing_an_inactive_mapping_is_a_no_op() {
        let result = classify_close_failure(
            &name(),
            &output(4, "", "Device box.img is not active."),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn busy_close_is_reported_as_busy() {
        let error = classify_close_failure(
            &name(),
            &output(5, "", "Device box.img is still in use."),
        )
        .unwrap_err();
        assert!(matches!(error, ContainerError::Busy { .. }));
    }

    #[test]
    fn key_file_credentials_run_in_batch_mode() {
        let argv = credential_args(&Credential::KeyFile(PathBuf::from("/srv/box.img.pw")));
        assert_eq!(
            argv,
            vec![
                OsString::from("--batch-mode"),
                OsString::from("--key-file"),
                OsString::from("/srv/box.img.pw"),
            ]
        );
        assert!(credential_args(&Credential::Interactive).is_empty());
    }
}
