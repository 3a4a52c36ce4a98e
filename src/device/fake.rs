//! Scripted in-memory device for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BackgroundCommand, CommandOutcome, Device};
use crate::error::{HarnessError, Result};

static NEXT_SERIAL: AtomicUsize = AtomicUsize::new(0);

type Responder = Box<dyn FnMut(&str) -> CommandOutcome + Send>;

#[derive(Default)]
pub(crate) struct FakeState {
    pub props: HashMap<String, String>,
    pub settings: HashMap<String, String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub pushes: Vec<String>,
    pub deletes: Vec<String>,
    pub commands: Vec<String>,
    pub background: Vec<String>,
    pub forwards: Vec<(u16, u16)>,
    pub root: bool,
}

pub(crate) struct FakeDevice {
    serial: String,
    state: Mutex<FakeState>,
    responders: Mutex<Vec<(String, Responder)>>,
    fail_push: Mutex<Option<String>>,
    interrupt_push: Mutex<Option<String>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        let id = NEXT_SERIAL.fetch_add(1, Ordering::SeqCst);
        Self {
            serial: format!("fake-{id}"),
            state: Mutex::new(FakeState::default()),
            responders: Mutex::new(Vec::new()),
            fail_push: Mutex::new(None),
            interrupt_push: Mutex::new(None),
        }
    }

    /// Device reporting the given `ro.product.cpu.abilist`.
    pub fn with_abis(abilist: &str) -> Self {
        let device = Self::new();
        device.set_prop("ro.product.cpu.abilist", abilist);
        device
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_prop(&self, name: &str, value: &str) {
        self.state().props.insert(name.to_string(), value.to_string());
    }

    pub fn prop(&self, name: &str) -> Option<String> {
        self.state().props.get(name).cloned()
    }

    pub fn has_file(&self, remote: &str) -> bool {
        self.state().files.contains_key(remote)
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state().pushes.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deletes.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn background(&self) -> Vec<String> {
        self.state().background.clone()
    }

    /// Make pushes whose remote path contains `needle` fail.
    pub fn fail_push_matching(&self, needle: &str) {
        *self.fail_push.lock().unwrap() = Some(needle.to_string());
    }

    /// Make pushes whose remote path contains `needle` land on the device and
    /// then report a transfer error.
    pub fn interrupt_push_matching(&self, needle: &str) {
        *self.interrupt_push.lock().unwrap() = Some(needle.to_string());
    }

    /// Answer commands containing `needle` with `responder`. Later
    /// registrations take precedence.
    pub fn on<F>(&self, needle: &str, responder: F)
    where
        F: FnMut(&str) -> CommandOutcome + Send + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .push((needle.to_string(), Box::new(responder)));
    }

    fn builtin(&self, command: &str) -> CommandOutcome {
        let mut state = self.state();
        if let Some(name) = command.strip_prefix("getprop ") {
            let value = state.props.get(name.trim()).cloned().unwrap_or_default();
            return CommandOutcome::completed(0, format!("{value}\n"), "");
        }
        if let Some(rest) = command.strip_prefix("setprop ") {
            let (name, value) = rest.split_once(' ').unwrap_or((rest, "''"));
            let value = shell_unquote(value);
            if value.is_empty() {
                state.props.remove(name);
            } else {
                state.props.insert(name.to_string(), value);
            }
            return CommandOutcome::completed(0, "", "");
        }
        if let Some(rest) = command.strip_prefix("test -") {
            let path = shell_unquote(&rest[2..]);
            let code = if state.files.contains_key(&path) { 0 } else { 1 };
            return CommandOutcome::completed(code, "", "");
        }
        if let Some(rest) = command.strip_prefix("rm -rf ") {
            let path = shell_unquote(rest);
            state.files.remove(&path);
            state.deletes.push(path);
            return CommandOutcome::completed(0, "", "");
        }
        if let Some(rest) = command.strip_prefix("cat ") {
            let path = shell_unquote(rest);
            return match state.files.get(&path) {
                Some(data) => CommandOutcome::completed(0, String::from_utf8_lossy(data), ""),
                None => CommandOutcome::completed(1, "", format!("cat: {path}: No such file or directory")),
            };
        }
        if command == "id -u" {
            let uid = if state.root { "0" } else { "2000" };
            return CommandOutcome::completed(0, format!("{uid}\n"), "");
        }
        if let Some(rest) = command.strip_prefix("settings get ") {
            let value = state
                .settings
                .get(rest.trim())
                .cloned()
                .unwrap_or_else(|| "null".to_string());
            return CommandOutcome::completed(0, format!("{value}\n"), "");
        }
        if let Some(rest) = command.strip_prefix("settings put ") {
            let mut parts = rest.splitn(3, ' ');
            let ns = parts.next().unwrap_or_default();
            let key = parts.next().unwrap_or_default();
            let value = shell_unquote(parts.next().unwrap_or("''"));
            state.settings.insert(format!("{ns} {key}"), value);
            return CommandOutcome::completed(0, "", "");
        }
        if command.starts_with("pgrep ") {
            return CommandOutcome::completed(1, "", "");
        }
        if command.starts_with("kill ") {
            let pid = command.rsplit(' ').next().unwrap_or_default();
            return CommandOutcome::completed(1, "", format!("/system/bin/sh: kill: {pid}: No such process"));
        }
        CommandOutcome::completed(0, "", "")
    }
}

impl Device for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute_shell(&self, command: &str, _timeout: Duration, _retries: u32) -> CommandOutcome {
        self.state().commands.push(command.to_string());
        let mut responders = self.responders.lock().unwrap();
        for (needle, responder) in responders.iter_mut().rev() {
            if command.contains(needle.as_str()) {
                return responder(command);
            }
        }
        drop(responders);
        self.builtin(command)
    }

    fn execute_shell_background(&self, command: &str) -> Result<Box<dyn BackgroundCommand>> {
        self.state().background.push(command.to_string());
        Ok(Box::new(FakeBackground {
            running: Arc::new(AtomicBool::new(true)),
        }))
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        if let Some(needle) = self.fail_push.lock().unwrap().as_deref() {
            if remote.contains(needle) {
                return Err(HarnessError::SetupFailed(format!("push {remote} refused")));
            }
        }
        let data = std::fs::read(local)
            .map_err(|err| HarnessError::from_io_error(local.display().to_string(), err))?;
        let mut state = self.state();
        state.files.insert(remote.to_string(), data);
        state.pushes.push(remote.to_string());
        if let Some(needle) = self.interrupt_push.lock().unwrap().as_deref() {
            if remote.contains(needle) {
                return Err(HarnessError::SetupFailed(format!("push {remote} interrupted")));
            }
        }
        Ok(())
    }

    fn enable_root(&self) -> Result<bool> {
        self.state().root = true;
        Ok(true)
    }

    fn disable_root(&self) -> Result<bool> {
        self.state().root = false;
        Ok(true)
    }

    fn wait_for_available(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn forward_tcp(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let mut state = self.state();
        let port = if local_port == 0 {
            40_000 + state.forwards.len() as u16
        } else {
            local_port
        };
        state.forwards.push((port, remote_port));
        Ok(port)
    }

    fn remove_forward(&self, local_port: u16) -> Result<()> {
        self.state().forwards.retain(|(port, _)| *port != local_port);
        Ok(())
    }
}

struct FakeBackground {
    running: Arc<AtomicBool>,
}

impl BackgroundCommand for FakeBackground {
    fn output(&self) -> String {
        String::new()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Undo shell quoting for a single word: `'..'`, `".."` and bare characters
/// concatenate, stopping at the first unquoted space.
pub(crate) fn shell_unquote(word: &str) -> String {
    let mut out = String::new();
    let mut chars = word.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    out.push(c);
                }
            }
            '"' => {
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    out.push(c);
                }
            }
            ' ' => break,
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::shell_quote;

    #[test]
    fn unquote_reverses_quote() {
        for value in ["a b", "it's", "'", "$x", ""] {
            assert_eq!(shell_unquote(&shell_quote(value)), value);
        }
    }

    #[test]
    fn properties_round_trip_through_shell() {
        let device = FakeDevice::new();
        assert!(device.set_property("debug.x", "a b").unwrap());
        assert_eq!(device.get_property("debug.x").unwrap().as_deref(), Some("a b"));
        device.set_property("debug.x", "").unwrap();
        assert_eq!(device.get_property("debug.x").unwrap(), None);
    }

    #[test]
    fn responders_take_precedence() {
        let device = FakeDevice::new();
        device.on("echo", |_| CommandOutcome::completed(0, "scripted", ""));
        assert_eq!(device.shell("echo hi").stdout, "scripted");
    }
}
