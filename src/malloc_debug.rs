//! Scoped libc malloc debug instrumentation
//!
//! A [`MallocDebugSession`] turns on bionic's malloc debug for one program,
//! optionally restarting a running service so it picks the options up, and on
//! release scans the malloc_debug log for heap corruption reports. Findings
//! fail the session release: assertions may fire during teardown.
//!
//! Only one session may be active per device. The device-side options
//! property is the wire-level lock; an in-process set of device serials
//! mirrors it so a second session fails without a round trip.

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::config::{DEFAULT_PROCESS_WAIT, DEVICE_AVAILABLE_TIMEOUT, POLL_INTERVAL};
use crate::device::Device;
use crate::error::{first_error, HarnessError, Result};
use crate::process::ProcessRegistry;
use crate::scope::{set_property_scoped, RevertStack};

pub const OPTIONS_PROPERTY: &str = "libc.debug.malloc.options";
pub const PROGRAM_PROPERTY: &str = "libc.debug.malloc.program";

/// Serials of devices with an active session in this process.
static ACTIVE: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// Heap corruption reports emitted by malloc debug.
const SIGNATURES: &[(&str, &str)] = &[
    (
        "corrupted front guard",
        r"(?m)^.*\+\+\+ ALLOCATION 0x[0-9a-fA-F]+ SIZE \d+ HAS A CORRUPTED FRONT GUARD.*$",
    ),
    (
        "corrupted rear guard",
        r"(?m)^.*\+\+\+ ALLOCATION 0x[0-9a-fA-F]+ SIZE \d+ HAS A CORRUPTED REAR GUARD.*$",
    ),
    (
        "use after free",
        r"(?m)^.*\+\+\+ ALLOCATION 0x[0-9a-fA-F]+ USED AFTER FREE.*$",
    ),
    (
        "leaked block",
        r"(?m)^.*\+\+\+ .*leaked block of size \d+ at 0x[0-9a-fA-F]+.*$",
    ),
    (
        "unknown pointer free",
        r"(?m)^.*\+\+\+ ALLOCATION 0x[0-9a-fA-F]+ UNKNOWN POINTER.*$",
    ),
    (
        "invalid tag",
        r"(?m)^.*\+\+\+ ALLOCATION 0x[0-9a-fA-F]+ HAS INVALID TAG.*$",
    ),
];

fn signatures() -> &'static [(&'static str, Regex)] {
    static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|(kind, pattern)| {
                let re = Regex::new(pattern).expect("malloc debug signature must compile");
                (*kind, re)
            })
            .collect()
    })
}

/// One heap corruption report found in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MallocDebugFinding {
    pub kind: &'static str,
    pub line: String,
}

/// Scan log text for every known malloc debug error signature.
pub fn scan_malloc_debug_log(log: &str) -> Vec<MallocDebugFinding> {
    let mut findings = Vec::new();
    for (kind, re) in signatures() {
        for m in re.find_iter(log) {
            findings.push(MallocDebugFinding {
                kind,
                line: m.as_str().trim().to_string(),
            });
        }
    }
    findings
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MallocDebugConfig {
    /// Value for `libc.debug.malloc.options`, e.g. `backtrace guard`.
    pub options: String,
    /// Program name for `libc.debug.malloc.program`; also the process pattern
    /// used to restart a service.
    pub target_process: String,
    /// Restart the running service so it reloads under malloc debug.
    pub is_service: bool,
}

impl MallocDebugConfig {
    pub fn new(options: impl Into<String>, target_process: impl Into<String>, is_service: bool) -> Self {
        Self {
            options: options.into(),
            target_process: target_process.into(),
            is_service,
        }
    }
}

/// Releases the in-process slot for a device on drop.
struct ActiveSlot {
    serial: String,
}

impl ActiveSlot {
    fn acquire(serial: &str) -> Option<Self> {
        let mut active = ACTIVE.lock().unwrap_or_else(|p| p.into_inner());
        active.insert(serial.to_string()).then(|| Self {
            serial: serial.to_string(),
        })
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = ACTIVE.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.serial);
    }
}

pub struct MallocDebugSession {
    config: MallocDebugConfig,
    reverts: RevertStack,
    poll_interval: Duration,
    service_wait: Duration,
    _slot: ActiveSlot,
}

impl MallocDebugSession {
    pub fn open(device: &dyn Device, config: MallocDebugConfig) -> Result<Self> {
        Self::open_with(device, config, POLL_INTERVAL, DEFAULT_PROCESS_WAIT)
    }

    pub(crate) fn open_with(
        device: &dyn Device,
        config: MallocDebugConfig,
        poll_interval: Duration,
        service_wait: Duration,
    ) -> Result<Self> {
        let slot = ActiveSlot::acquire(device.serial()).ok_or_else(|| {
            HarnessError::MallocDebugAlreadyActive {
                property: OPTIONS_PROPERTY.to_string(),
                value: "held by another session in this process".to_string(),
            }
        })?;
        if let Some(value) = device.get_property(OPTIONS_PROPERTY)? {
            return Err(HarnessError::MallocDebugAlreadyActive {
                property: OPTIONS_PROPERTY.to_string(),
                value,
            });
        }

        let mut session = Self {
            config,
            reverts: RevertStack::new(),
            poll_interval,
            service_wait,
            _slot: slot,
        };
        if let Err(err) = session.configure(device) {
            if let Err(revert_err) = session.reverts.unwind(device) {
                warn!("failed to revert malloc debug setup: {revert_err}");
            }
            return Err(HarnessError::Skipped(format!(
                "could not enable malloc debug for {}: {err}",
                session.config.target_process
            )));
        }
        info!(
            "malloc debug '{}' enabled for {}",
            session.config.options, session.config.target_process
        );
        Ok(session)
    }

    fn configure(&mut self, device: &dyn Device) -> Result<()> {
        device.shell_checked("logcat -c")?;
        self.reverts
            .push(set_property_scoped(device, OPTIONS_PROPERTY, &self.config.options)?);
        self.reverts.push(set_property_scoped(
            device,
            PROGRAM_PROPERTY,
            &self.config.target_process,
        )?);
        if self.config.is_service {
            self.restart_service(device)?;
        }
        Ok(())
    }

    fn restart_service(&self, device: &dyn Device) -> Result<()> {
        let registry = ProcessRegistry::new(device).with_poll_interval(self.poll_interval);
        registry.kill_all(&self.config.target_process, self.service_wait, true)?;
        registry.wait_until_running(&self.config.target_process, self.service_wait)?;
        Ok(())
    }

    pub fn config(&self) -> &MallocDebugConfig {
        &self.config
    }

    /// Undo the configuration and fail if malloc debug reported corruption.
    pub fn release(mut self, device: &dyn Device) -> Result<()> {
        let available = device.wait_for_available(DEVICE_AVAILABLE_TIMEOUT);
        let reverted = self.reverts.unwind(device);
        let restarted = if self.config.is_service {
            self.restart_service(device)
        } else {
            Ok(())
        };
        let findings = device
            .shell_checked("logcat -d -s malloc_debug")
            .and_then(|log| self.assert_clean(&log));
        first_error([findings, available, reverted, restarted])
    }

    fn assert_clean(&self, log: &str) -> Result<()> {
        let findings = scan_malloc_debug_log(log);
        if findings.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = findings
            .iter()
            .map(|f| format!("[{}] {}", f.kind, f.line))
            .collect();
        Err(HarnessError::AssertionFailed(format!(
            "malloc debug reported errors for {}:\n{}",
            self.config.target_process,
            lines.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::CommandOutcome;

    const UAF_LOG: &str = "\
04-01 10:00:00.000  1234  1234 E malloc_debug: +++ ALLOCATION 0x7b2c012340 USED AFTER FREE (free)
04-01 10:00:00.000  1234  1234 E malloc_debug: Backtrace at time of failure:";

    fn open(device: &FakeDevice, config: MallocDebugConfig) -> Result<MallocDebugSession> {
        MallocDebugSession::open_with(device, config, Duration::from_millis(1), Duration::from_secs(1))
    }

    fn poc_config() -> MallocDebugConfig {
        MallocDebugConfig::new("backtrace guard", "poc_cve_x", false)
    }

    #[test]
    fn every_signature_is_compiled() {
        assert_eq!(signatures().len(), SIGNATURES.len());
    }

    #[test]
    fn scan_detects_every_signature() {
        let log = "\
E malloc_debug: +++ ALLOCATION 0xdead SIZE 16 HAS A CORRUPTED FRONT GUARD
E malloc_debug: +++ ALLOCATION 0xdead SIZE 16 HAS A CORRUPTED REAR GUARD
E malloc_debug: +++ ALLOCATION 0xbeef USED AFTER FREE (free)
E malloc_debug: +++ poc leaked block of size 32 at 0x1234 (leak 1 of 1)
E malloc_debug: +++ ALLOCATION 0xbeef UNKNOWN POINTER (free)
E malloc_debug: +++ ALLOCATION 0xbeef HAS INVALID TAG 1ee7d00d (free)";
        let kinds: Vec<_> = scan_malloc_debug_log(log).iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "corrupted front guard",
                "corrupted rear guard",
                "use after free",
                "leaked block",
                "unknown pointer free",
                "invalid tag"
            ]
        );
    }

    #[test]
    fn scan_ignores_unrelated_lines() {
        assert!(scan_malloc_debug_log("I malloc_debug: malloc debug enabled").is_empty());
    }

    #[test]
    fn existing_property_fails_before_touching_state() {
        let device = FakeDevice::new();
        device.set_prop(OPTIONS_PROPERTY, "backtrace");
        let err = open(&device, poc_config()).err().unwrap();
        assert!(err.to_string().contains("already set"));
        assert!(matches!(err, HarnessError::MallocDebugAlreadyActive { .. }));
        assert_eq!(device.commands(), vec![format!("getprop {OPTIONS_PROPERTY}")]);
        assert_eq!(device.prop(OPTIONS_PROPERTY).as_deref(), Some("backtrace"));
    }

    #[test]
    fn in_process_guard_fails_without_round_trip() {
        let device = FakeDevice::new();
        let session = open(&device, poc_config()).unwrap();
        let before = device.commands().len();
        let err = open(&device, poc_config()).err().unwrap();
        assert!(matches!(err, HarnessError::MallocDebugAlreadyActive { .. }));
        assert_eq!(device.commands().len(), before);
        session.release(&device).unwrap();
        open(&device, poc_config()).unwrap().release(&device).unwrap();
    }

    #[test]
    fn clean_session_sets_and_restores_properties() {
        let device = FakeDevice::new();
        let session = open(&device, poc_config()).unwrap();
        assert_eq!(device.prop(OPTIONS_PROPERTY).as_deref(), Some("backtrace guard"));
        assert_eq!(device.prop(PROGRAM_PROPERTY).as_deref(), Some("poc_cve_x"));
        session.release(&device).unwrap();
        assert_eq!(device.prop(OPTIONS_PROPERTY), None);
        assert_eq!(device.prop(PROGRAM_PROPERTY), None);
        assert!(device.commands().iter().any(|c| c == "logcat -c"));
    }

    #[test]
    fn findings_fail_release_after_cleanup() {
        let device = FakeDevice::new();
        device.on("logcat -d", |_| CommandOutcome::completed(0, UAF_LOG, ""));
        let session = open(&device, poc_config()).unwrap();
        let err = session.release(&device).unwrap_err();
        assert!(err.is_assertion());
        assert!(err.to_string().contains("USED AFTER FREE"));
        assert_eq!(device.prop(OPTIONS_PROPERTY), None);
        open(&device, poc_config()).unwrap().release(&device).ok();
    }

    #[test]
    fn setup_failure_reverts_and_skips() {
        let device = FakeDevice::new();
        device.on(&format!("setprop {PROGRAM_PROPERTY}"), |_| {
            CommandOutcome::completed(1, "", "setprop: failed")
        });
        let err = open(&device, poc_config()).err().unwrap();
        assert!(err.is_skip());
        assert_eq!(device.prop(OPTIONS_PROPERTY), None);
        assert!(ActiveSlot::acquire(device.serial()).is_some());
    }

    #[test]
    fn service_is_restarted_on_open_and_release() {
        let device = FakeDevice::new();
        device.on("pgrep", |_| {
            CommandOutcome::completed(0, "321 /system/bin/mediaserver\n", "")
        });
        let config = MallocDebugConfig::new("guard", "mediaserver", true);
        let session = open(&device, config).unwrap();
        session.release(&device).unwrap();
        let kills = device
            .commands()
            .iter()
            .filter(|c| c.as_str() == "kill -9 321")
            .count();
        assert_eq!(kills, 2);
    }
}
