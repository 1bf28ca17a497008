// SPDX-License-Identifier: GPL-3.0-only

//! `cryptbox` command-line interface

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cryptbox::{CreateRequest, Interrupt, Lifecycle, MountRequest, config, logging};
use cryptbox_types::{ContainerError, Credential, ErrorKind, Resolution, RuntimeConfig};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Parser)]
#[command(
    name = "cryptbox",
    version,
    about = "Create, mount and unmount LUKS-encrypted container files"
)]
struct Cli {
    /// Debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Progress output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: /etc/cryptbox.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new encrypted container file
    Create {
        /// Container file to create
        #[arg(short = 'c', long = "container", value_name = "FILE")]
        container: PathBuf,

        /// Size in MiB
        #[arg(
            short = 's',
            long = "size",
            value_name = "SIZE_MB",
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        size_mib: u64,

        /// Generate a key file at <FILE>.pw instead of prompting for a passphrase
        #[arg(short = 'k', long = "key-file")]
        key_file: bool,

        /// Overwrite an existing container (and key file)
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Open a container and mount its filesystem
    Mount {
        container: PathBuf,
        mount_point: PathBuf,

        /// Unlock with this key file instead of prompting
        #[arg(short = 'k', long = "key-file", value_name = "KEYFILE")]
        key_file: Option<PathBuf>,
    },

    /// Unmount containers and release their devices
    Unmount {
        #[arg(required = true, value_name = "MOUNTPOINT")]
        mount_points: Vec<PathBuf>,
    },

    /// Show the mapping and loop device behind mount points
    Status {
        #[arg(required = true, value_name = "MOUNTPOINT")]
        mount_points: Vec<PathBuf>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct StatusReport {
    mount_point: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("cryptbox: fatal: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let force = matches!(cli.command, Command::Create { force: true, .. });
    let runtime = RuntimeConfig::new(settings).with_flags(cli.debug, cli.verbose, force);

    let _log_guard = logging::init(runtime.log_level(), runtime.settings.log_file.as_deref())?;

    let interrupt = Interrupt::new();
    interrupt
        .install()
        .context("failed to install signal handler")?;

    if !cryptbox_sys::is_privileged() {
        warn!("Not running as root; loop, mapper and mount operations will likely fail");
    }

    let backends = cryptbox_sys::system_backends(&runtime.settings)
        .map_err(ContainerError::from)
        .context("failed to set up system backends")?;
    let lifecycle = Lifecycle::new(backends, interrupt);

    let code = match cli.command {
        Command::Create {
            container,
            size_mib,
            key_file,
            ..
        } => report(
            CreateRequest::from_mib(container, size_mib, key_file)
                .and_then(|request| lifecycle.create(&runtime, &request)),
            |outcome| {
                println!("Created {}", outcome.container.display());
                if let Some(key_file) = &outcome.key_file {
                    println!("Key file {}", key_file.display());
                }
            },
        ),
        Command::Mount {
            container,
            mount_point,
            key_file,
        } => {
            let request = MountRequest {
                container,
                mount_point,
                credential: key_file.map_or(Credential::Interactive, Credential::KeyFile),
            };
            report(lifecycle.mount(&runtime, &request), |outcome| {
                println!(
                    "Mounted {} on {}",
                    outcome.container.display(),
                    outcome.mount_point.display()
                );
            })
        }
        Command::Unmount { mount_points } => {
            let batch = lifecycle.unmount_all(&runtime, &mount_points);
            for (mount_point, result) in &batch.results {
                match result {
                    Ok(outcome) => {
                        println!("Unmounted {}", mount_point.display());
                        for warning in &outcome.warnings {
                            eprintln!("cryptbox: warning: {}: {warning}", mount_point.display());
                        }
                    }
                    Err(error) => eprintln!(
                        "cryptbox: {}: {error} ({})",
                        mount_point.display(),
                        error.kind().as_str()
                    ),
                }
            }
            for mount_point in &batch.skipped {
                eprintln!("cryptbox: {}: skipped after interrupt", mount_point.display());
            }
            exit_code(batch.succeeded())
        }
        Command::Status { mount_points, json } => {
            let reports: Vec<StatusReport> = mount_points
                .into_iter()
                .map(|mount_point| match lifecycle.status(&mount_point) {
                    Ok(resolution) => StatusReport {
                        mount_point,
                        resolution: Some(resolution),
                        error: None,
                        kind: None,
                    },
                    Err(error) => StatusReport {
                        mount_point,
                        resolution: None,
                        error: Some(error.to_string()),
                        kind: Some(error.kind()),
                    },
                })
                .collect();
            print_status(&reports, json)?;
            exit_code(reports.iter().all(|report| report.error.is_none()))
        }
    };
    Ok(code)
}

fn report<T>(result: cryptbox_types::Result<T>, on_success: impl FnOnce(&T)) -> ExitCode {
    match result {
        Ok(outcome) => {
            on_success(&outcome);
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("{}", error);
            eprintln!("cryptbox: fatal: {error} ({})", error.kind().as_str());
            ExitCode::FAILURE
        }
    }
}

fn print_status(reports: &[StatusReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for report in reports {
        match (&report.resolution, &report.error) {
            (Some(resolution), _) => {
                println!("{}", resolution.mount_point.display());
                println!("  device:  {}", resolution.block_device.display());
                println!("  mapping: {}", resolution.mapping);
                println!("  loop:    {}", resolution.loop_device);
            }
            (None, Some(error)) => {
                eprintln!("cryptbox: {}: {error}", report.mount_point.display());
            }
            (None, None) => {}
        }
    }
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_requires_container_and_size() {
        assert!(Cli::try_parse_from(["cryptbox", "create", "-s", "10"]).is_err());
        assert!(Cli::try_parse_from(["cryptbox", "create", "-c", "box.img"]).is_err());
        assert!(Cli::try_parse_from(["cryptbox", "create", "-c", "box.img", "-s", "0"]).is_err());
        assert!(Cli::try_parse_from(["cryptbox", "create", "-c", "box.img", "-s", "ten"]).is_err());

        let cli = Cli::try_parse_from(["cryptbox", "-v", "create", "-c", "box.img", "-s", "10", "-k", "-f"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Create {
                size_mib,
                key_file,
                force,
                ..
            } => {
                assert_eq!(size_mib, 10);
                assert!(key_file && force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn mount_takes_optional_key_file() {
        let cli =
            Cli::try_parse_from(["cryptbox", "mount", "box.img", "/mnt/box", "-k", "box.img.pw", "-d"])
                .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Mount { key_file, .. } => {
                assert_eq!(key_file, Some(PathBuf::from("box.img.pw")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unmount_needs_at_least_one_path() {
        assert!(Cli::try_parse_from(["cryptbox", "unmount"]).is_err());
        let cli = Cli::try_parse_from(["cryptbox", "unmount", "/mnt/a", "/mnt/b"]).unwrap();
        match cli.command {
            Command::Unmount { mount_points } => assert_eq!(mount_points.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn help_is_not_an_error_exit() {
        let error = Cli::try_parse_from(["cryptbox", "--help"]).unwrap_err();
        assert!(!error.use_stderr());
        let error = Cli::try_parse_from(["cryptbox", "create"]).unwrap_err();
        assert!(error.use_stderr());
    }
}
