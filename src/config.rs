use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STAGING_DIR: &str = "/data/local/tmp/";
pub const DEFAULT_ADB: &str = "adb";
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POC_TIMEOUT_SECS: u64 = 5 * 60;
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_PROCESS_WAIT: Duration = Duration::from_secs(30);
pub const DEVICE_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FRIDA_VERSION: &str = "16.5.9";
pub const DEFAULT_MALLOC_DEBUG_OPTIONS: &str = "backtrace guard";
/// Exit code PoCs use to report that the device is vulnerable.
pub const VULNERABLE_EXIT_CODE: i32 = 113;

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Path to the `adb` executable.
    pub adb_path: PathBuf,
    /// Device serial passed as `adb -s`; `None` lets adb pick the only device.
    pub serial: Option<String>,
    /// Remote directory for binaries, resources and scripts.
    pub staging_dir: String,
    /// Timeout applied to housekeeping shell commands.
    pub shell_timeout: Duration,
    /// Retries for shell commands that failed at the transport level.
    pub shell_retries: u32,
    /// Period of every polling loop.
    pub poll_interval: Duration,
    /// Local directories searched for `<name>_sts32` / `<name>_sts64`.
    pub poc_dirs: Vec<PathBuf>,
    /// Local directory resources are read from.
    pub resource_dir: Option<PathBuf>,
    pub frida: FridaConfig,
}

#[derive(Clone, Debug)]
pub struct FridaConfig {
    /// Release tag of frida-inject to use.
    pub version: String,
    /// Directory where downloaded injector binaries are cached.
    pub cache_dir: PathBuf,
    /// How long to wait for the injector process to show up.
    pub start_timeout: Duration,
}

impl Default for FridaConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_FRIDA_VERSION.to_string(),
            cache_dir: std::env::temp_dir().join("poc-harness-frida"),
            start_timeout: DEFAULT_PROCESS_WAIT,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from(DEFAULT_ADB),
            serial: None,
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            shell_retries: 1,
            poll_interval: POLL_INTERVAL,
            poc_dirs: vec![PathBuf::from(".")],
            resource_dir: None,
            frida: FridaConfig::default(),
        }
    }
}

/// Join a remote directory and a file name with exactly one `/`.
pub fn remote_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
