use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{BackgroundCommand, CommandOutcome, CommandStatus, Device};
use crate::config::{HarnessConfig, DEFAULT_SHELL_TIMEOUT_SECS, POLL_INTERVAL};
use crate::error::{HarnessError, Result};

const CHILD_POLL: Duration = Duration::from_millis(20);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const ROOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Substrings adb prints when the transport, not the remote command, failed.
const TRANSPORT_ERRORS: &[&str] = &[
    "error: device",
    "error: closed",
    "error: protocol fault",
    "device offline",
    "no devices/emulators found",
    "cannot connect to daemon",
];

/// [`Device`] backed by the `adb` executable.
pub struct AdbDevice {
    adb: PathBuf,
    serial: String,
    explicit_serial: bool,
    poll_interval: Duration,
    shell_timeout: Duration,
    shell_retries: u32,
}

impl AdbDevice {
    pub fn new(adb: impl Into<PathBuf>, serial: Option<String>) -> Self {
        let explicit_serial = serial.is_some();
        Self {
            adb: adb.into(),
            serial: serial.unwrap_or_else(|| "default".to_string()),
            explicit_serial,
            poll_interval: POLL_INTERVAL,
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            shell_retries: 0,
        }
    }

    pub fn from_config(cfg: &HarnessConfig) -> Self {
        let mut device = Self::new(cfg.adb_path.clone(), cfg.serial.clone());
        device.poll_interval = cfg.poll_interval;
        device.shell_timeout = cfg.shell_timeout;
        device.shell_retries = cfg.shell_retries;
        device
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.adb);
        if self.explicit_serial {
            cmd.arg("-s").arg(&self.serial);
        }
        cmd.args(args);
        cmd
    }

    fn run<I, S>(&self, args: I, timeout: Duration) -> CommandOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match cmd.spawn() {
            Ok(child) => classify_transport(wait_with_timeout(child, timeout)),
            Err(err) => CommandOutcome::exception(format!("spawn {}: {err}", self.adb.display())),
        }
    }

    fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let outcome = self.run(args, timeout);
        outcome.into_stdout(&format!("adb {}", args.join(" ")))
    }
}

impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute_shell(&self, command: &str, timeout: Duration, retries: u32) -> CommandOutcome {
        let mut attempt = 0;
        loop {
            debug!(serial = %self.serial, attempt, "adb shell {command}");
            let outcome = self.run(["shell", command], timeout);
            if outcome.status != CommandStatus::Exception || attempt >= retries {
                return outcome;
            }
            attempt += 1;
            warn!(
                "transport failure running `{command}` ({}); retry {attempt}/{retries}",
                outcome.stderr.trim()
            );
            thread::sleep(self.poll_interval);
        }
    }

    fn shell(&self, command: &str) -> CommandOutcome {
        self.execute_shell(command, self.shell_timeout, self.shell_retries)
    }

    fn execute_shell_background(&self, command: &str) -> Result<Box<dyn BackgroundCommand>> {
        debug!(serial = %self.serial, "adb shell (background) {command}");
        let mut child = self
            .command(["shell", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| HarnessError::Transport {
                command: command.to_string(),
                reason: err.to_string(),
            })?;
        let output = Arc::new(Mutex::new(String::new()));
        pump(child.stdout.take(), output.clone());
        pump(child.stderr.take(), output.clone());
        Ok(Box::new(AdbBackground {
            child: Mutex::new(child),
            output,
        }))
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        let outcome = self.run(
            [OsStr::new("push"), local.as_os_str(), OsStr::new(remote)],
            TRANSFER_TIMEOUT,
        );
        if outcome.is_success() {
            return Ok(());
        }
        Err(HarnessError::SetupFailed(format!(
            "push {} -> {remote} failed ({:?}): {}",
            local.display(),
            outcome.status,
            outcome.stderr.trim()
        )))
    }

    fn enable_root(&self) -> Result<bool> {
        self.run_checked(&["root"], ROOT_TIMEOUT)?;
        self.run_checked(&["wait-for-device"], ROOT_TIMEOUT)?;
        self.is_root()
    }

    fn disable_root(&self) -> Result<bool> {
        self.run_checked(&["unroot"], ROOT_TIMEOUT)?;
        self.run_checked(&["wait-for-device"], ROOT_TIMEOUT)?;
        Ok(!self.is_root()?)
    }

    fn wait_for_available(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let unavailable = || HarnessError::DeviceUnavailable {
            serial: self.serial.clone(),
            timeout_secs: timeout.as_secs(),
        };
        if !self.run(["wait-for-device"], timeout).is_success() {
            return Err(unavailable());
        }
        loop {
            let booted = self.shell("getprop sys.boot_completed");
            if booted.is_success() && booted.stdout.trim() == "1" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(unavailable());
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn forward_tcp(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let local = format!("tcp:{local_port}");
        let remote = format!("tcp:{remote_port}");
        let stdout = self.run_checked(&["forward", &local, &remote], ROOT_TIMEOUT)?;
        if local_port != 0 {
            return Ok(local_port);
        }
        stdout.trim().parse::<u16>().map_err(|_| {
            HarnessError::SetupFailed(format!("adb forward returned '{}'", stdout.trim()))
        })
    }

    fn remove_forward(&self, local_port: u16) -> Result<()> {
        let local = format!("tcp:{local_port}");
        self.run_checked(&["forward", "--remove", &local], ROOT_TIMEOUT)
            .map(|_| ())
    }
}

struct AdbBackground {
    child: Mutex<Child>,
    output: Arc<Mutex<String>>,
}

impl AdbBackground {
    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BackgroundCommand for AdbBackground {
    fn output(&self) -> String {
        self.output
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    fn is_running(&self) -> bool {
        matches!(self.child().try_wait(), Ok(None))
    }

    fn stop(&self) {
        let mut child = self.child();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for AdbBackground {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump<R: Read + Send + 'static>(reader: Option<R>, sink: Arc<Mutex<String>>) {
    let Some(mut reader) = reader else {
        return;
    };
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    }
                }
            }
        }
    });
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for `child` against a deadline computed once; kill it when the
/// deadline passes.
fn wait_with_timeout(mut child: Child, timeout: Duration) -> CommandOutcome {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return CommandOutcome::exception(format!("wait for adb: {err}"));
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(CHILD_POLL);
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    match status {
        Some(status) => match status.code() {
            Some(code) => CommandOutcome::completed(code, stdout, stderr),
            None => CommandOutcome::exception(format!("adb terminated by signal: {stderr}")),
        },
        None => CommandOutcome::timed_out(stdout, stderr),
    }
}

fn classify_transport(outcome: CommandOutcome) -> CommandOutcome {
    if outcome.status == CommandStatus::Failed && is_transport_error(&outcome.stderr) {
        return CommandOutcome::exception(outcome.stderr);
    }
    outcome
}

fn is_transport_error(stderr: &str) -> bool {
    TRANSPORT_ERRORS.iter().any(|needle| stderr.contains(needle))
}
