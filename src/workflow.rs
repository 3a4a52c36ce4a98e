use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::config::HarnessConfig;
use crate::device::Device;
use crate::error::{HarnessError, Result, Verdict};
use crate::frida::{DynamicInstrumentationSession, ReleaseFetcher};
use crate::poc::{NativePocRunner, PocSpec, RunReport};
use crate::process::{ProcessHandle, ProcessRegistry};
use crate::rootcanal::RootcanalSession;
use crate::signals::{install_interrupt_handler, wait_for_interrupt};

pub const EXIT_PASS: u8 = 0;
pub const EXIT_FAIL: u8 = 1;
/// Conventional "skipped" status understood by automake-style runners.
pub const EXIT_SKIP: u8 = 77;

/// Process exit status for the outcome of a command.
pub fn exit_status<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => EXIT_PASS,
        Err(err) => match err.verdict() {
            Verdict::Skip => EXIT_SKIP,
            Verdict::Fail => EXIT_FAIL,
        },
    }
}

pub fn run_poc_workflow(
    device: &dyn Device,
    cfg: &HarnessConfig,
    spec: &PocSpec,
    json: bool,
) -> Result<RunReport> {
    println!("[*]  Running {} on {}", spec.name(), device.serial());
    let report = NativePocRunner::new(device, cfg).run(spec)?;
    if json {
        let rendered = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
        println!("{rendered}");
    } else {
        println!(
            "[+]  {} passed ({}-bit, {:?}, exit {:?})",
            spec.name(),
            report.bits,
            report.outcome.status,
            report.outcome.exit_code
        );
    }
    Ok(report)
}

pub fn list_processes(
    device: &dyn Device,
    cfg: &HarnessConfig,
    pattern: &str,
    single: bool,
) -> Result<Vec<ProcessHandle>> {
    let registry = ProcessRegistry::new(device).with_poll_interval(cfg.poll_interval);
    if single {
        registry.find_single_process(pattern)?;
    }
    let handles = registry.find_handles(pattern)?;
    if handles.is_empty() {
        println!("[*]  No process matches '{pattern}'");
    }
    for handle in &handles {
        println!("{}\t{}", handle.pid, handle.command_line);
    }
    Ok(handles)
}

pub fn kill_all_workflow(
    device: &dyn Device,
    cfg: &HarnessConfig,
    pattern: &str,
    expect: bool,
    timeout: Duration,
) -> Result<Vec<i32>> {
    let killed = ProcessRegistry::new(device)
        .with_poll_interval(cfg.poll_interval)
        .kill_all(pattern, timeout, expect)?;
    println!("[*]  Killed {} process(es) matching '{pattern}'", killed.len());
    Ok(killed)
}

/// What the injector should instrument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FridaTarget {
    Pid(i32),
    Spawn(String),
}

/// Inject `script_path` and hold the session until interrupted or until
/// `hold` elapses. Returns the injector output.
pub fn frida_workflow(
    device: &dyn Device,
    cfg: &HarnessConfig,
    fetcher: &dyn ReleaseFetcher,
    target: &FridaTarget,
    script_path: &Path,
    hold: Option<Duration>,
) -> Result<String> {
    let script = fs::read_to_string(script_path)
        .map_err(|err| HarnessError::from_io_error(script_path.display().to_string(), err))?;
    install_interrupt_handler()?;

    let mut session = DynamicInstrumentationSession::open(device, cfg, fetcher)?;
    let injector = match target {
        FridaTarget::Pid(pid) => session.attach(*pid, &script)?,
        FridaTarget::Spawn(program) => session.spawn(program, &script)?,
    };
    println!("[*]  frida-inject running as pid {injector}; Ctrl-C to stop");
    if wait_for_interrupt(hold, cfg.poll_interval) {
        info!("interrupted, tearing down frida session");
    }
    let output = session.output();
    session.close()?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(output)
}

/// Attach rootcanal and hold it until interrupted or until `hold` elapses.
/// Returns the forwarded host port.
pub fn rootcanal_workflow(
    device: &dyn Device,
    cfg: &HarnessConfig,
    binary: &Path,
    port: u16,
    hold: Option<Duration>,
) -> Result<u16> {
    install_interrupt_handler()?;

    let session = RootcanalSession::open(device, cfg, binary, port)?;
    let host_port = session.host_port();
    println!("[*]  rootcanal test channel on localhost:{host_port}; Ctrl-C to stop");
    if wait_for_interrupt(hold, cfg.poll_interval) {
        info!("interrupted, restoring bluetooth stack");
    }
    session.close()?;
    Ok(host_port)
}
