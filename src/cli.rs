use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::asserter::{Asserter, CompositeAsserter, CrashAsserter, ExitCodeAsserter, MallocDebugAsserter};
use crate::config::{HarnessConfig, DEFAULT_MALLOC_DEBUG_OPTIONS, DEFAULT_POC_TIMEOUT_SECS};
use crate::error::{HarnessError, Result};
use crate::poc::{Bitness, PocSpec};

#[derive(Parser, Debug)]
#[command(
    name = "poc-harness",
    about = "Run native security PoCs on an Android device and assert they stay harmless",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Path to the adb executable.
    #[arg(long, value_name = "PATH", env = "ADB", global = true)]
    pub adb: Option<PathBuf>,

    /// Serial of the target device.
    #[arg(short = 's', long, value_name = "SERIAL", env = "ANDROID_SERIAL", global = true)]
    pub serial: Option<String>,

    /// Remote staging directory for binaries and resources.
    #[arg(long = "staging-dir", value_name = "DIR", global = true)]
    pub staging_dir: Option<String>,

    /// Timeout for housekeeping shell commands (seconds).
    #[arg(long = "shell-timeout", value_name = "SECONDS", global = true)]
    pub shell_timeout: Option<u64>,

    /// Retries for shell commands that hit a transport failure.
    #[arg(long, value_name = "COUNT", global = true)]
    pub retries: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push a PoC, run it and assert that it did no harm.
    Run(RunCommand),
    /// List device processes whose command line matches a pattern.
    Pids(PidsCommand),
    /// SIGKILL every device process matching a pattern.
    KillAll(KillAllCommand),
    /// Inject a frida script into a process until interrupted.
    Frida(FridaCommand),
    /// Attach a rootcanal virtual Bluetooth controller until interrupted.
    Rootcanal(RootcanalCommand),
}

#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// PoC name; the local files are `<NAME>_sts32` and `<NAME>_sts64`.
    pub name: String,

    /// Arguments passed to the PoC.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    pub args: Vec<String>,

    /// Directory containing PoC builds (repeatable).
    #[arg(long = "poc-dir", value_name = "DIR")]
    pub poc_dirs: Vec<PathBuf>,

    /// Local directory resources are read from.
    #[arg(long = "resource-dir", value_name = "DIR")]
    pub resource_dir: Option<PathBuf>,

    /// Resource to upload before the run (repeatable).
    #[arg(long = "resource", value_name = "NAME")]
    pub resources: Vec<String>,

    /// Remote directory resources are uploaded to.
    #[arg(long = "resource-upload-dir", value_name = "DIR")]
    pub resource_upload_dir: Option<String>,

    /// Environment variable for the PoC (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// PoC timeout (seconds).
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_POC_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Only run the 32-bit build.
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "only64")]
    pub only32: bool,

    /// Only run the 64-bit build.
    #[arg(long, action = ArgAction::SetTrue)]
    pub only64: bool,

    /// Do not add the system library directory to LD_LIBRARY_PATH.
    #[arg(long = "no-default-library-path", action = ArgAction::SetTrue)]
    pub no_default_library_path: bool,

    /// Skip instead of pass when the PoC exits nonzero.
    #[arg(long = "require-success", action = ArgAction::SetTrue)]
    pub require_success: bool,

    /// Fail when the PoC exits with the vulnerable exit code (113).
    #[arg(long = "assert-not-vulnerable", action = ArgAction::SetTrue)]
    pub assert_not_vulnerable: bool,

    /// Fail unless the PoC exits with this code.
    #[arg(long = "expect-exit-code", value_name = "CODE", allow_negative_numbers = true)]
    pub expect_exit_code: Option<i32>,

    /// Fail on security-relevant native crashes of the PoC.
    #[arg(long, action = ArgAction::SetTrue)]
    pub crash: bool,

    /// Also watch crashes of processes matching PATTERN (repeatable).
    #[arg(long = "crash-process", value_name = "PATTERN")]
    pub crash_processes: Vec<String>,

    /// Run the PoC under libc malloc debug.
    #[arg(long = "malloc-debug", action = ArgAction::SetTrue, conflicts_with = "malloc_debug_service")]
    pub malloc_debug: bool,

    /// Run a service under libc malloc debug; it is restarted around the PoC.
    #[arg(long = "malloc-debug-service", value_name = "PROCESS")]
    pub malloc_debug_service: Option<String>,

    /// Options written to libc.debug.malloc.options.
    #[arg(long = "malloc-debug-options", value_name = "OPTIONS")]
    pub malloc_debug_options: Option<String>,

    /// Print the run report as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PidsCommand {
    /// Pattern matched against full command lines.
    pub pattern: String,

    /// Fail when more than one process matches.
    #[arg(long, action = ArgAction::SetTrue)]
    pub single: bool,
}

#[derive(Args, Debug, Clone)]
pub struct KillAllCommand {
    /// Pattern matched against full command lines.
    pub pattern: String,

    /// Fail when nothing matches.
    #[arg(long, action = ArgAction::SetTrue)]
    pub expect: bool,

    /// Time to wait for each process to exit (seconds).
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct FridaCommand {
    /// Pid of the process to attach to.
    #[arg(long, value_name = "PID", conflicts_with = "spawn", required_unless_present = "spawn")]
    pub pid: Option<i32>,

    /// Program to spawn under the injector.
    #[arg(long, value_name = "PROGRAM")]
    pub spawn: Option<String>,

    /// JavaScript file to inject.
    #[arg(long, value_name = "PATH")]
    pub script: PathBuf,

    /// frida-inject release tag.
    #[arg(id = "frida_version", long = "frida-version", value_name = "VERSION")]
    pub version: Option<String>,

    /// Directory where downloaded injectors are cached.
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECONDS")]
    pub duration: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct RootcanalCommand {
    /// Local rootcanal executable built for the device.
    pub binary: PathBuf,

    /// Host port forwarded to the controller test port; 0 picks one.
    #[arg(long, value_name = "PORT", default_value_t = 0)]
    pub port: u16,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECONDS")]
    pub hold: Option<u64>,
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

impl GlobalOpts {
    pub fn to_config(&self) -> HarnessConfig {
        let mut cfg = HarnessConfig::default();
        if let Some(adb) = &self.adb {
            cfg.adb_path = adb.clone();
        }
        cfg.serial = self.serial.clone();
        if let Some(dir) = &self.staging_dir {
            cfg.staging_dir = dir.clone();
        }
        if let Some(secs) = self.shell_timeout {
            cfg.shell_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(retries) = self.retries {
            cfg.shell_retries = retries;
        }
        cfg
    }

    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

impl RunCommand {
    pub fn apply_to(&self, cfg: &mut HarnessConfig) {
        if !self.poc_dirs.is_empty() {
            cfg.poc_dirs = self.poc_dirs.clone();
        }
        if let Some(dir) = &self.resource_dir {
            cfg.resource_dir = Some(dir.clone());
        }
    }

    fn asserters(&self) -> CompositeAsserter {
        let mut asserters: Vec<Box<dyn Asserter>> = Vec::new();
        if let Some(code) = self.expect_exit_code {
            asserters.push(Box::new(ExitCodeAsserter::equals(code)));
        }
        if self.assert_not_vulnerable {
            asserters.push(Box::new(ExitCodeAsserter::assert_not_vulnerable_exit_code()));
        }
        if self.crash || !self.crash_processes.is_empty() {
            let crash = self
                .crash_processes
                .iter()
                .fold(CrashAsserter::new(), |crash, pattern| crash.with_process(pattern));
            asserters.push(Box::new(crash));
        }
        let options = self
            .malloc_debug_options
            .as_deref()
            .unwrap_or(DEFAULT_MALLOC_DEBUG_OPTIONS);
        if let Some(service) = &self.malloc_debug_service {
            asserters.push(Box::new(MallocDebugAsserter::for_service(service).with_options(options)));
        } else if self.malloc_debug {
            asserters.push(Box::new(MallocDebugAsserter::for_poc().with_options(options)));
        }
        CompositeAsserter::new(asserters)
    }

    pub fn to_spec(&self, cfg: &HarnessConfig) -> Result<PocSpec> {
        let bitness = if self.only32 {
            Bitness::Only32
        } else if self.only64 {
            Bitness::Only64
        } else {
            Bitness::Auto
        };

        let mut builder = PocSpec::builder(&self.name)
            .args(self.args.iter().cloned())
            .timeout_secs(self.timeout)
            .bitness(bitness)
            .use_default_library_path(!self.no_default_library_path)
            .require_success(self.require_success)
            .resource_upload_dir(
                self.resource_upload_dir
                    .clone()
                    .unwrap_or_else(|| cfg.staging_dir.clone()),
            );
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        for resource in &self.resources {
            builder = builder.resource(resource);
        }
        if !self.resources.is_empty() && cfg.resource_dir.is_none() {
            return Err(HarnessError::ConfigError(
                "--resource needs --resource-dir".to_string(),
            ));
        }

        let asserters = self.asserters();
        if !asserters.is_empty() {
            builder = builder.asserter(asserters);
        }
        builder.build()
    }
}

impl FridaCommand {
    pub fn apply_to(&self, cfg: &mut HarnessConfig) {
        if let Some(version) = &self.version {
            cfg.frida.version = version.clone();
        }
        if let Some(dir) = &self.cache_dir {
            cfg.frida.cache_dir = dir.clone();
        }
    }
}
