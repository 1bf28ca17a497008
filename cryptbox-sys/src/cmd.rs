// SPDX-License-Identifier: GPL-3.0-only

//! Process execution for the wrapped command-line tools
//!
//! Captured runs are bounded by a timeout and killed when it expires.
//! Interactive runs inherit the terminal so the tool can prompt the user,
//! and are never bounded.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr if present, otherwise stdout, trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            "no additional output".to_string()
        } else {
            stdout.to_string()
        }
    }
}

pub fn render<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut rendered = program.display().to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.as_ref().to_string_lossy());
    }
    rendered
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run with captured output and the configured timeout.
    pub fn run<S: AsRef<OsStr>>(&self, program: &Path, args: &[S]) -> Result<CommandOutput> {
        let rendered = render(program, args);
        debug!("Running {}", rendered);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SysError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        let status = self.wait_with_timeout(&mut child, &rendered)?;

        let stdout = stdout_handle
            .join()
            .map_err(|_| SysError::OperationFailed("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SysError::OperationFailed("stderr reader thread panicked".into()))??;

        let output = CommandOutput {
            command: rendered,
            stdout,
            stderr,
            status: exit_code(status),
        };
        debug!("{} exited with {}", output.command, output.status);
        Ok(output)
    }

    /// Run attached to the terminal; output is not captured.
    pub fn run_interactive<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
    ) -> Result<CommandOutput> {
        let rendered = render(program, args);
        debug!("Running {} (interactive)", rendered);

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| SysError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        Ok(CommandOutput {
            command: rendered,
            stdout: String::new(),
            stderr: String::new(),
            status: exit_code(status),
        })
    }

    fn wait_with_timeout(&self, child: &mut Child, rendered: &str) -> Result<ExitStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if start.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SysError::Timeout {
                    command: rendered.to_string(),
                    after: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Build an argument vector from mixed strings and paths.
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    items
        .into_iter()
        .map(|item| item.as_ref().to_os_string())
        .collect()
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal: report the conventional 128 + signo.
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |signal| 128 + signal))
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}
