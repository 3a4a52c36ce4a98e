//! Reversible device state
//!
//! Scoped resources are modelled as an explicit stack of revert actions.
//! Acquisition pushes a [`Revert`]; teardown pops them in reverse order and
//! runs every one of them, even after a failure.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{HarnessError, Result};

type RevertFn = Box<dyn FnOnce(&dyn Device) -> Result<()>>;

/// One undo step.
pub struct Revert {
    label: String,
    action: RevertFn,
}

impl Revert {
    pub fn new<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(&dyn Device) -> Result<()> + 'static,
    {
        Self {
            label: label.into(),
            action: Box::new(action),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn run(self, device: &dyn Device) -> Result<()> {
        debug!("reverting {}", self.label);
        (self.action)(device)
    }
}

/// LIFO stack of [`Revert`] steps.
#[derive(Default)]
pub struct RevertStack {
    entries: Vec<Revert>,
}

impl RevertStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, revert: Revert) {
        self.entries.push(revert);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels from the most recently pushed to the oldest.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().rev().map(Revert::label).collect()
    }

    /// Run every step newest-first. All steps run; the first failure is
    /// returned and later ones are logged.
    pub fn unwind(&mut self, device: &dyn Device) -> Result<()> {
        let mut first: Option<HarnessError> = None;
        while let Some(revert) = self.entries.pop() {
            let label = revert.label.clone();
            if let Err(err) = revert.run(device) {
                warn!("failed to revert {label}: {err}");
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A file placed on the device. Whoever pushed it deletes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadedArtifact {
    /// Source on the host; `None` when the content came from a temp file.
    pub local_path: Option<PathBuf>,
    pub remote_path: String,
}

impl UploadedArtifact {
    pub fn new(local_path: Option<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path,
            remote_path: remote_path.into(),
        }
    }

    pub fn delete(&self, device: &dyn Device) -> Result<()> {
        device.delete_file(&self.remote_path)
    }
}

/// Set a device property and return the step that restores its previous
/// value (clearing it when it was unset).
pub fn set_property_scoped(device: &dyn Device, name: &str, value: &str) -> Result<Revert> {
    let previous = device.get_property(name)?.unwrap_or_default();
    if !device.set_property(name, value)? {
        return Err(HarnessError::SetupFailed(format!(
            "could not set property {name}"
        )));
    }
    let name = name.to_string();
    Ok(Revert::new(format!("property {name}"), move |device| {
        if device.set_property(&name, &previous)? {
            Ok(())
        } else {
            Err(HarnessError::SetupFailed(format!(
                "could not restore property {name}"
            )))
        }
    }))
}

/// Set a settings value and return the step that restores it.
pub fn set_setting_scoped(
    device: &dyn Device,
    namespace: &str,
    key: &str,
    value: &str,
) -> Result<Revert> {
    let previous = device.get_setting(namespace, key)?;
    device.set_setting(namespace, key, value)?;
    let namespace = namespace.to_string();
    let key = key.to_string();
    Ok(Revert::new(format!("setting {namespace}/{key}"), move |device| {
        match previous {
            Some(previous) => device.set_setting(&namespace, &key, &previous),
            None => device
                .shell_checked(&format!("settings delete {namespace} {key}"))
                .map(|_| ()),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unwind_runs_lifo_and_keeps_first_error() {
        let device = FakeDevice::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut stack = RevertStack::new();
        for name in ["a", "b", "c"] {
            let order = order.clone();
            stack.push(Revert::new(name, move |_| {
                order.borrow_mut().push(name);
                if name == "a" || name == "b" {
                    Err(HarnessError::SetupFailed(name.to_string()))
                } else {
                    Ok(())
                }
            }));
        }
        assert_eq!(stack.labels(), vec!["c", "b", "a"]);

        let err = stack.unwind(&device).unwrap_err();
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
        assert!(err.to_string().contains('b'));
        assert!(stack.is_empty());
    }

    #[test]
    fn scoped_property_restores_previous_value() {
        let device = FakeDevice::new();
        device.set_prop("debug.mode", "old");
        let revert = set_property_scoped(&device, "debug.mode", "new").unwrap();
        assert_eq!(device.prop("debug.mode").as_deref(), Some("new"));
        revert.run(&device).unwrap();
        assert_eq!(device.prop("debug.mode").as_deref(), Some("old"));
    }

    #[test]
    fn scoped_property_clears_unset_value() {
        let device = FakeDevice::new();
        let revert = set_property_scoped(&device, "debug.fresh", "1").unwrap();
        revert.run(&device).unwrap();
        assert_eq!(device.prop("debug.fresh"), None);
    }

    #[test]
    fn scoped_setting_restores_value() {
        let device = FakeDevice::new();
        device.set_setting("global", "bluetooth_on", "0").unwrap();
        let revert = set_setting_scoped(&device, "global", "bluetooth_on", "1").unwrap();
        assert_eq!(
            device.get_setting("global", "bluetooth_on").unwrap().as_deref(),
            Some("1")
        );
        revert.run(&device).unwrap();
        assert_eq!(
            device.get_setting("global", "bluetooth_on").unwrap().as_deref(),
            Some("0")
        );
    }
}
