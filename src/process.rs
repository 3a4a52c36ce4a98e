//! Remote process discovery and signalling
//!
//! All waits poll at a fixed period against a deadline computed once at loop
//! entry. PIDs can be reused between polls; callers must tolerate the rare
//! flake this causes.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::config::{DEFAULT_PROCESS_WAIT, POLL_INTERVAL};
use crate::device::{shell_quote, CommandStatus, Device};
use crate::error::{HarnessError, Result};
use crate::scope::Revert;

/// Why a signal could not be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillFailure {
    InvalidSignal,
    InsufficientPermissions,
    NoSuchProcess,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillOutcome {
    Success,
    Failed(KillFailure),
}

/// Whether `cmdline` is the remote shell running `query` for `pattern`,
/// with or without the shell quoting still visible.
fn is_own_query(cmdline: &str, query: &str, pattern: &str) -> bool {
    let cmdline = cmdline.trim();
    let is_shell = cmdline
        .split_whitespace()
        .next()
        .is_some_and(|argv0| argv0 == "sh" || argv0.ends_with("/sh"));
    is_shell
        && (cmdline.ends_with(query) || cmdline.ends_with(&format!("pgrep -f -l {pattern}")))
}

/// A process seen by a query. Purely informational; the pid may be stale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    pub command_line: String,
}

/// Remote shell error text mapped to a failure reason, matched in order.
const KILL_ERRORS: &[(&str, KillFailure)] = &[
    ("invalid signal specification", KillFailure::InvalidSignal),
    ("Operation not permitted", KillFailure::InsufficientPermissions),
    ("No such process", KillFailure::NoSuchProcess),
];

/// Classify the stderr of a failed `kill`. Unrecognised text is `Unknown`.
pub fn classify_kill_error(stderr: &str) -> KillFailure {
    KILL_ERRORS
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, reason)| *reason)
        .unwrap_or(KillFailure::Unknown)
}

/// Parse `9`, `KILL` or `SIGKILL`.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| HarnessError::ConfigError(format!("unknown signal number {number}")));
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| HarnessError::ConfigError(format!("unknown signal {name}")))
}

pub struct ProcessRegistry<'d> {
    device: &'d dyn Device,
    poll_interval: Duration,
}

impl<'d> ProcessRegistry<'d> {
    pub fn new(device: &'d dyn Device) -> Self {
        Self {
            device,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Processes whose full command line matches `pattern`.
    ///
    /// `Ok(empty)` means the query ran and matched nothing; a query that could
    /// not run is [`HarnessError::ProcessQueryFailed`].
    pub fn find_processes(&self, pattern: &str) -> Result<BTreeMap<i32, String>> {
        let command = format!("pgrep -f -l {}", shell_quote(pattern));
        let outcome = self.device.shell(&command);
        let query_failed = |reason: String| HarnessError::ProcessQueryFailed {
            pattern: pattern.to_string(),
            reason,
        };

        match outcome.status {
            CommandStatus::Success => {}
            CommandStatus::Failed
                if outcome.exit_code == Some(1)
                    && outcome.stdout.trim().is_empty()
                    && outcome.stderr.trim().is_empty() =>
            {
                return Ok(BTreeMap::new());
            }
            CommandStatus::Failed => {
                return Err(query_failed(format!(
                    "exit {:?}: {}",
                    outcome.exit_code,
                    outcome.stderr.trim()
                )))
            }
            CommandStatus::TimedOut => return Err(query_failed("timed out".to_string())),
            CommandStatus::Exception => return Err(query_failed(outcome.stderr)),
        }

        let mut found = BTreeMap::new();
        for line in outcome.stdout.lines() {
            let line = line.trim();
            let (pid, cmdline) = line.split_once(' ').unwrap_or((line, ""));
            let Ok(pid) = pid.parse::<i32>() else {
                continue;
            };
            // The shell wrapping our own query carries the pattern too.
            if is_own_query(cmdline, &command, pattern) {
                continue;
            }
            found.insert(pid, cmdline.trim().to_string());
        }
        Ok(found)
    }

    pub fn find_handles(&self, pattern: &str) -> Result<Vec<ProcessHandle>> {
        Ok(self
            .find_processes(pattern)?
            .into_iter()
            .map(|(pid, command_line)| ProcessHandle { pid, command_line })
            .collect())
    }

    /// The single pid matching `pattern`, `None` when nothing matches.
    pub fn find_single_process(&self, pattern: &str) -> Result<Option<i32>> {
        let found = self.find_processes(pattern)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.keys().next().copied()),
            _ => Err(HarnessError::AmbiguousProcess {
                pattern: pattern.to_string(),
                pids: found.keys().copied().collect(),
            }),
        }
    }

    /// Poll until at least one process matches `pattern`.
    pub fn wait_until_running(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<i32, String>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_processes(pattern) {
                Ok(found) if !found.is_empty() => return Ok(found),
                Ok(_) => {}
                Err(err @ HarnessError::ProcessQueryFailed { .. }) => {
                    debug!("transient process query failure: {err}");
                }
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::WaitTimeout {
                    what: format!("a process matching '{pattern}'"),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Poll a signal-0 probe until `pid` is gone.
    pub fn wait_until_exited(&self, pid: i32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self.device.shell(&format!("kill -0 {pid}"));
            match outcome.status {
                CommandStatus::Success => {}
                CommandStatus::Failed => match classify_kill_error(&outcome.stderr) {
                    KillFailure::NoSuchProcess => return Ok(()),
                    _ => {
                        return Err(HarnessError::KillFailed {
                            pid,
                            reason: KillFailure::Unknown,
                        })
                    }
                },
                CommandStatus::TimedOut | CommandStatus::Exception => {
                    debug!("liveness probe for {pid} failed: {}", outcome.stderr.trim());
                }
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::WaitTimeout {
                    what: format!("pid {pid} to exit"),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Send `signal` to `pid` and wait for it to exit.
    pub fn kill(&self, pid: i32, signal: Signal, timeout: Duration) -> KillOutcome {
        let outcome = self.device.shell(&format!("kill -{} {pid}", signal as i32));
        match outcome.status {
            CommandStatus::Success => {}
            CommandStatus::Failed => {
                return KillOutcome::Failed(classify_kill_error(&outcome.stderr));
            }
            CommandStatus::TimedOut | CommandStatus::Exception => {
                warn!("kill {pid} did not complete: {}", outcome.stderr.trim());
                return KillOutcome::Failed(KillFailure::Unknown);
            }
        }
        match self.wait_until_exited(pid, timeout) {
            Ok(()) => KillOutcome::Success,
            Err(HarnessError::KillFailed { reason, .. }) => KillOutcome::Failed(reason),
            Err(err) => {
                warn!("pid {pid} survived {signal:?}: {err}");
                KillOutcome::Failed(KillFailure::Unknown)
            }
        }
    }

    /// SIGKILL every process matching `pattern`; processes that are already
    /// gone are tolerated. Returns the pids that were signalled.
    pub fn kill_all(
        &self,
        pattern: &str,
        timeout: Duration,
        expect_at_least_one: bool,
    ) -> Result<Vec<i32>> {
        let found = self.find_processes(pattern)?;
        if found.is_empty() {
            if expect_at_least_one {
                return Err(HarnessError::ExpectedProcessNotFound(pattern.to_string()));
            }
            return Ok(Vec::new());
        }

        let mut killed = Vec::with_capacity(found.len());
        for (pid, cmdline) in found {
            debug!("killing {pid} ({cmdline})");
            match self.kill(pid, Signal::SIGKILL, timeout) {
                KillOutcome::Success | KillOutcome::Failed(KillFailure::NoSuchProcess) => {
                    killed.push(pid)
                }
                KillOutcome::Failed(reason) => {
                    return Err(HarnessError::KillFailed { pid, reason });
                }
            }
        }
        Ok(killed)
    }

    /// Kill everything matching `pattern` now, and again when the returned
    /// scope is released (after `on_before_close`).
    pub fn scoped_kill(
        &self,
        pattern: &str,
        on_before_close: Option<Box<dyn FnOnce(&dyn Device) -> Result<()>>>,
    ) -> Result<ScopedKill> {
        self.kill_all(pattern, DEFAULT_PROCESS_WAIT, false)?;
        Ok(ScopedKill {
            pattern: pattern.to_string(),
            poll_interval: self.poll_interval,
            on_before_close,
        })
    }
}

/// Handle returned by [`ProcessRegistry::scoped_kill`].
pub struct ScopedKill {
    pattern: String,
    poll_interval: Duration,
    on_before_close: Option<Box<dyn FnOnce(&dyn Device) -> Result<()>>>,
}

impl ScopedKill {
    pub fn release(self, device: &dyn Device) -> Result<()> {
        let callback = match self.on_before_close {
            Some(callback) => callback(device),
            None => Ok(()),
        };
        let registry = ProcessRegistry::new(device).with_poll_interval(self.poll_interval);
        let kill = registry
            .kill_all(&self.pattern, DEFAULT_PROCESS_WAIT, false)
            .map(|_| ());
        crate::error::first_error([callback, kill])
    }

    pub fn into_revert(self) -> Revert {
        let label = format!("kill '{}'", self.pattern);
        Revert::new(label, move |device| self.release(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::CommandOutcome;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    /// Fake process table answering `pgrep`, `kill -0` and `kill -N`.
    fn with_processes(device: &FakeDevice, procs: &[(i32, &str)]) -> Arc<Mutex<BTreeMap<i32, String>>> {
        let table = Arc::new(Mutex::new(
            procs
                .iter()
                .map(|(pid, cmd)| (*pid, cmd.to_string()))
                .collect::<BTreeMap<_, _>>(),
        ));
        let pgrep = table.clone();
        device.on("pgrep -f -l ", move |cmd| {
            let pattern = crate::device::fake::shell_unquote(&cmd["pgrep -f -l ".len()..]);
            let out: String = pgrep
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, c)| c.contains(&pattern))
                .map(|(pid, c)| format!("{pid} {c}\n"))
                .collect();
            if out.is_empty() {
                CommandOutcome::completed(1, "", "")
            } else {
                CommandOutcome::completed(0, out, "")
            }
        });
        let kill = table.clone();
        device.on("kill -", move |cmd| {
            let mut parts = cmd.split_whitespace().skip(1);
            let signal = parts.next().unwrap_or_default();
            let pid: i32 = parts.next().unwrap_or_default().parse().unwrap();
            let mut table = kill.lock().unwrap();
            if !table.contains_key(&pid) {
                return CommandOutcome::completed(1, "", format!("kill: {pid}: No such process"));
            }
            if signal != "-0" {
                table.remove(&pid);
            }
            CommandOutcome::completed(0, "", "")
        });
        table
    }

    fn registry(device: &FakeDevice) -> ProcessRegistry<'_> {
        ProcessRegistry::new(device).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            classify_kill_error("sh: kill: invalid signal specification"),
            KillFailure::InvalidSignal
        );
        assert_eq!(
            classify_kill_error("kill: 1: Operation not permitted"),
            KillFailure::InsufficientPermissions
        );
        assert_eq!(classify_kill_error("kill: 5: No such process"), KillFailure::NoSuchProcess);
        assert_eq!(classify_kill_error("segfault in shell"), KillFailure::Unknown);
    }

    #[test]
    fn parse_signal_forms() {
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGSEGV").unwrap(), Signal::SIGSEGV);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn find_single_process_zero_one_many() {
        let device = FakeDevice::new();
        with_processes(&device, &[(10, "/system/bin/a_service"), (11, "/system/bin/b_service"), (12, "/system/bin/b_service --x")]);
        let reg = registry(&device);
        assert_eq!(reg.find_single_process("nothing").unwrap(), None);
        assert_eq!(reg.find_single_process("a_service").unwrap(), Some(10));
        match reg.find_single_process("b_service") {
            Err(HarnessError::AmbiguousProcess { pids, .. }) => assert_eq!(pids, vec![11, 12]),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn query_failure_is_distinct_from_no_match() {
        let device = FakeDevice::new();
        device.on("pgrep", |_| CommandOutcome::completed(2, "", "pgrep: bad regex"));
        let err = registry(&device).find_processes("(").unwrap_err();
        assert!(matches!(err, HarnessError::ProcessQueryFailed { .. }));

        let device = FakeDevice::new();
        assert!(registry(&device).find_processes("x").unwrap().is_empty());
    }

    #[test]
    fn own_query_shell_is_ignored() {
        let device = FakeDevice::new();
        device.on("pgrep", |_| {
            CommandOutcome::completed(0, "7 sh -c pgrep -f -l 'svc'\n8 /system/bin/svc\n", "")
        });
        let found = registry(&device).find_processes("svc").unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn targets_named_after_pgrep_are_kept() {
        let device = FakeDevice::new();
        device.on("pgrep", |_| {
            CommandOutcome::completed(
                0,
                "7 /system/bin/sh -c pgrep -f -l pgrep_fuzz\n9 /data/local/tmp/pgrep_fuzz --iterations 3\n",
                "",
            )
        });
        let found = registry(&device).find_processes("pgrep_fuzz").unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn second_kill_is_no_such_process() {
        let device = FakeDevice::new();
        with_processes(&device, &[(42, "poc")]);
        let reg = registry(&device);
        assert_eq!(reg.kill(42, Signal::SIGKILL, Duration::from_secs(1)), KillOutcome::Success);
        assert_eq!(
            reg.kill(42, Signal::SIGKILL, Duration::from_secs(1)),
            KillOutcome::Failed(KillFailure::NoSuchProcess)
        );
    }

    #[test]
    fn kill_classifies_permission_errors() {
        let device = FakeDevice::new();
        device.on("kill -9", |_| {
            CommandOutcome::completed(1, "", "kill: 1: Operation not permitted")
        });
        assert_eq!(
            registry(&device).kill(1, Signal::SIGKILL, Duration::from_secs(1)),
            KillOutcome::Failed(KillFailure::InsufficientPermissions)
        );
    }

    #[test]
    fn unexpected_probe_error_is_unknown() {
        let device = FakeDevice::new();
        device.on("kill -0", |_| CommandOutcome::completed(1, "", "kill: weird"));
        let err = registry(&device)
            .wait_until_exited(5, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::KillFailed {
                reason: KillFailure::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn kill_all_expecting_processes_fails_when_none_match() {
        let device = FakeDevice::new();
        with_processes(&device, &[]);
        let reg = registry(&device);
        assert!(reg.kill_all("ghost", Duration::from_secs(1), false).unwrap().is_empty());
        let err = reg.kill_all("ghost", Duration::from_secs(1), true).unwrap_err();
        assert!(err.to_string().contains("Expected to kill processes matching"));
        assert!(err.is_assertion());
    }

    #[test]
    fn kill_all_kills_every_match() {
        let device = FakeDevice::new();
        let table = with_processes(&device, &[(1, "media.swcodec"), (2, "media.swcodec"), (3, "other")]);
        let killed = registry(&device)
            .kill_all("media.swcodec", Duration::from_secs(1), true)
            .unwrap();
        assert_eq!(killed, vec![1, 2]);
        assert_eq!(table.lock().unwrap().keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn wait_until_running_polls_until_found() {
        let device = FakeDevice::new();
        let mut calls = 0;
        device.on("pgrep", move |_| {
            calls += 1;
            if calls < 3 {
                CommandOutcome::completed(1, "", "")
            } else {
                CommandOutcome::completed(0, "99 /vendor/bin/hw/svc\n", "")
            }
        });
        let found = registry(&device)
            .wait_until_running("svc", Duration::from_secs(5))
            .unwrap();
        assert!(found.contains_key(&99));
    }

    #[test]
    fn wait_until_running_times_out() {
        let device = FakeDevice::new();
        let err = registry(&device)
            .wait_until_running("never", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, HarnessError::WaitTimeout { .. }));
    }

    #[test]
    fn scoped_kill_kills_again_after_callback() {
        let device = FakeDevice::new();
        let table = with_processes(&device, &[(5, "daemon")]);
        let reg = registry(&device);
        let scope = reg.scoped_kill("daemon", None).unwrap();
        assert!(table.lock().unwrap().is_empty());

        let respawn = table.clone();
        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let seen_in_cb = seen.clone();
        drop(scope);
        let scope = reg
            .scoped_kill(
                "daemon",
                Some(Box::new(move |_| {
                    respawn.lock().unwrap().insert(6, "daemon".into());
                    seen_in_cb.lock().unwrap().insert(6);
                    Ok(())
                })),
            )
            .unwrap();
        scope.release(&device).unwrap();
        assert!(seen.lock().unwrap().contains(&6));
        assert!(table.lock().unwrap().is_empty());
    }
}
