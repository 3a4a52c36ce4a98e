//! Device transport abstraction
//!
//! Everything in the harness talks to the target through the [`Device`] trait:
//! shell execution with a timeout, file transfer, properties and a handful of
//! transport-level toggles. [`AdbDevice`] implements it on top of the `adb`
//! executable; tests use a scripted fake.

mod abi;
mod adb;
#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::config::DEFAULT_SHELL_TIMEOUT_SECS;
use crate::error::{HarnessError, Result};

pub use abi::Abi;
pub use adb::AdbDevice;

/// Terminal state of one shell invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    /// Ran to completion with exit code 0.
    Success,
    /// Ran to completion with a nonzero exit code.
    Failed,
    /// Killed by the transport after the timeout elapsed.
    TimedOut,
    /// The transport failed before the command could complete.
    Exception,
}

/// Result of a single shell invocation. Produced once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
}

impl CommandOutcome {
    pub fn completed(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            status: if exit_code == 0 {
                CommandStatus::Success
            } else {
                CommandStatus::Failed
            },
        }
    }

    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            status: CommandStatus::TimedOut,
        }
    }

    pub fn exception(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: reason.into(),
            status: CommandStatus::Exception,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// True when the process ran to completion and has a real exit code.
    pub fn has_exit_code(&self) -> bool {
        matches!(self.status, CommandStatus::Success | CommandStatus::Failed)
    }

    /// Require a zero exit and hand back stdout.
    pub fn into_stdout(self, command: &str) -> Result<String> {
        match self.status {
            CommandStatus::Success => Ok(self.stdout),
            CommandStatus::Failed => Err(HarnessError::SetupFailed(format!(
                "`{command}` exited with {:?}: {}",
                self.exit_code,
                self.stderr.trim()
            ))),
            CommandStatus::TimedOut => Err(HarnessError::Transport {
                command: command.to_string(),
                reason: "timed out".to_string(),
            }),
            CommandStatus::Exception => Err(HarnessError::Transport {
                command: command.to_string(),
                reason: self.stderr,
            }),
        }
    }
}

/// A command started with [`Device::execute_shell_background`].
pub trait BackgroundCommand: Send {
    /// Output captured so far (stdout and stderr interleaved).
    fn output(&self) -> String;
    /// Whether the local side of the command is still alive.
    fn is_running(&self) -> bool;
    /// Stop the local side of the command. Idempotent.
    fn stop(&self);
}

/// Shell access to a single target device.
///
/// The harness assumes exclusive ownership of the device while a run is in
/// progress; implementations need no internal locking beyond what `&self`
/// methods require.
pub trait Device {
    /// Stable identifier of the device, used to key per-device state.
    fn serial(&self) -> &str;

    /// Run `command` through the device shell. Transport failures are retried
    /// up to `retries` times and otherwise reported as
    /// [`CommandStatus::Exception`]; this method never fails.
    fn execute_shell(&self, command: &str, timeout: Duration, retries: u32) -> CommandOutcome;

    /// Start `command` and return immediately; output accumulates in the
    /// returned handle.
    fn execute_shell_background(&self, command: &str) -> Result<Box<dyn BackgroundCommand>>;

    fn push_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Restart the device side with elevated privileges. Returns whether root
    /// is now active.
    fn enable_root(&self) -> Result<bool>;

    fn disable_root(&self) -> Result<bool>;

    /// Block until the device answers shell commands and has finished booting.
    fn wait_for_available(&self, timeout: Duration) -> Result<()>;

    /// Forward a host TCP port to a device TCP port. `local_port == 0` lets the
    /// transport choose; the bound host port is returned.
    fn forward_tcp(&self, local_port: u16, remote_port: u16) -> Result<u16>;

    fn remove_forward(&self, local_port: u16) -> Result<()>;

    /// Housekeeping shell command. The default uses the stock timeout and no
    /// retries; transports may apply their configured limits instead.
    fn shell(&self, command: &str) -> CommandOutcome {
        self.execute_shell(
            command,
            Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            0,
        )
    }

    /// Shell command that must exit 0; returns stdout.
    fn shell_checked(&self, command: &str) -> Result<String> {
        self.shell(command).into_stdout(command)
    }

    fn pull_file_contents(&self, remote: &str) -> Result<String> {
        self.shell_checked(&format!("cat {}", shell_quote(remote)))
    }

    fn delete_file(&self, remote: &str) -> Result<()> {
        self.shell_checked(&format!("rm -rf {}", shell_quote(remote)))
            .map(|_| ())
    }

    fn get_property(&self, name: &str) -> Result<Option<String>> {
        let value = self.shell_checked(&format!("getprop {name}"))?;
        let value = value.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    fn set_property(&self, name: &str, value: &str) -> Result<bool> {
        let outcome = self.shell(&format!("setprop {name} {}", shell_quote(value)));
        Ok(outcome.is_success())
    }

    fn get_setting(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value = self.shell_checked(&format!("settings get {namespace} {key}"))?;
        let value = value.trim();
        Ok((!value.is_empty() && value != "null").then(|| value.to_string()))
    }

    fn set_setting(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.shell_checked(&format!(
            "settings put {namespace} {key} {}",
            shell_quote(value)
        ))
        .map(|_| ())
    }

    fn is_root(&self) -> Result<bool> {
        Ok(self.shell_checked("id -u")?.trim() == "0")
    }

    /// Supported ABIs, most preferred first.
    fn abis(&self) -> Result<Vec<Abi>> {
        let list = match self.get_property("ro.product.cpu.abilist")? {
            Some(list) => list,
            None => self
                .get_property("ro.product.cpu.abi")?
                .ok_or_else(|| HarnessError::SetupFailed("device reports no ABI".to_string()))?,
        };
        let abis: Vec<Abi> = list
            .split(',')
            .filter_map(|name| Abi::from_name(name.trim()))
            .collect();
        if abis.is_empty() {
            return Err(HarnessError::SetupFailed(format!(
                "no supported ABI in '{list}'"
            )));
        }
        Ok(abis)
    }
}

/// Quote `value` for a POSIX shell. Every embedded `'` becomes `'"'"'`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}
