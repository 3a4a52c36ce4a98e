//! Virtual Bluetooth controller attach
//!
//! On virtual devices the Bluetooth HAL can be pointed at a rootcanal
//! controller, which lets Bluetooth PoCs inject raw HCI traffic from the
//! host. The session is a stack of reverts; closing it restores the stock
//! Bluetooth stack.

use std::path::Path;

use tracing::{info, warn};

use crate::config::{remote_path, HarnessConfig, DEFAULT_PROCESS_WAIT};
use crate::device::{shell_quote, Device};
use crate::error::{HarnessError, Result};
use crate::process::ProcessRegistry;
use crate::scope::{Revert, RevertStack};

pub const TEST_PORT: u16 = 6111;
pub const HCI_PORT: u16 = 6211;
pub const LINK_PORT: u16 = 6311;

/// Process name of the Bluetooth HAL service.
pub const BLUETOOTH_HAL: &str = "android.hardware.bluetooth";
const REMOTE_NAME: &str = "rootcanal";

/// Whether the device is a cuttlefish-style virtual device.
pub fn is_virtual_device(device: &dyn Device) -> Result<bool> {
    for prop in ["ro.hardware", "ro.product.board"] {
        if let Some(value) = device.get_property(prop)? {
            if value.contains("cutf") || value.contains("vsoc") {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn svc_bluetooth(device: &dyn Device, action: &str) -> Result<()> {
    device
        .shell_checked(&format!("svc bluetooth {action}"))
        .map(|_| ())
}

pub struct RootcanalSession<'d> {
    device: &'d dyn Device,
    reverts: RevertStack,
    host_port: u16,
}

impl<'d> RootcanalSession<'d> {
    /// Start `local_binary` on the device and forward `host_port` (0 picks a
    /// free one) to its test port.
    pub fn open(
        device: &'d dyn Device,
        cfg: &HarnessConfig,
        local_binary: &Path,
        host_port: u16,
    ) -> Result<Self> {
        if !is_virtual_device(device)? {
            return Err(HarnessError::Skipped(
                "rootcanal requires a virtual device".to_string(),
            ));
        }
        let mut session = Self {
            device,
            reverts: RevertStack::new(),
            host_port: 0,
        };
        if let Err(err) = session.start(cfg, local_binary, host_port) {
            if let Err(revert_err) = session.reverts.unwind(device) {
                warn!("rootcanal rollback failed: {revert_err}");
            }
            return Err(err);
        }
        Ok(session)
    }

    fn start(&mut self, cfg: &HarnessConfig, local_binary: &Path, host_port: u16) -> Result<()> {
        let device = self.device;
        let registry = ProcessRegistry::new(device).with_poll_interval(cfg.poll_interval);

        if !device.is_root()? {
            if !device.enable_root()? {
                return Err(HarnessError::Skipped("root is not available".to_string()));
            }
            self.reverts.push(Revert::new("disable root", |device| {
                device.disable_root().map(|_| ())
            }));
        }

        svc_bluetooth(device, "disable")?;
        self.reverts
            .push(Revert::new("enable bluetooth", |device| svc_bluetooth(device, "enable")));

        let hal = registry.scoped_kill(BLUETOOTH_HAL, None)?;
        self.reverts.push(hal.into_revert());

        let remote = remote_path(&cfg.staging_dir, REMOTE_NAME);
        let binary = remote.clone();
        self.reverts
            .push(Revert::new("delete rootcanal", move |device| device.delete_file(&binary)));
        device.push_file(local_binary, &remote)?;
        device.shell_checked(&format!("chmod 755 {}", shell_quote(&remote)))?;

        let command = format!(
            "cd {}; ./{REMOTE_NAME} --test_port={TEST_PORT} --hci_port={HCI_PORT} --link_port={LINK_PORT}",
            shell_quote(&cfg.staging_dir)
        );
        let background = device.execute_shell_background(&command)?;
        let poll_interval = cfg.poll_interval;
        self.reverts.push(Revert::new("stop rootcanal", move |device| {
            background.stop();
            ProcessRegistry::new(device)
                .with_poll_interval(poll_interval)
                .kill_all(&format!("./{REMOTE_NAME}"), DEFAULT_PROCESS_WAIT, false)
                .map(|_| ())
        }));
        registry.wait_until_running(&format!("./{REMOTE_NAME}"), DEFAULT_PROCESS_WAIT)?;

        let port = device.forward_tcp(host_port, TEST_PORT)?;
        self.reverts.push(Revert::new("remove forward", move |device| {
            device.remove_forward(port)
        }));
        self.host_port = port;

        svc_bluetooth(device, "enable")?;
        self.reverts
            .push(Revert::new("disable bluetooth", |device| svc_bluetooth(device, "disable")));
        info!("rootcanal test port forwarded to localhost:{port}");
        Ok(())
    }

    /// Host TCP port connected to the controller's test channel.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn close(mut self) -> Result<()> {
        self.reverts.unwind(self.device)
    }
}

impl Drop for RootcanalSession<'_> {
    fn drop(&mut self) {
        if self.reverts.is_empty() {
            return;
        }
        if let Err(err) = self.reverts.unwind(self.device) {
            warn!("rootcanal cleanup failed: {err}");
        }
    }
}
