use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use poc_harness::cli::{Cli, Commands};
use poc_harness::workflow::{
    exit_status, frida_workflow, kill_all_workflow, list_processes, rootcanal_workflow,
    run_poc_workflow, FridaTarget,
};
use poc_harness::{AdbDevice, GithubReleaseFetcher, HarnessConfig, HarnessError, Result};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.global.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = cli.global.to_config();
    let result = dispatch(cli.command, cfg);
    if let Err(err) = &result {
        eprintln!("[!]  {}", err.user_message());
    }
    ExitCode::from(exit_status(&result))
}

fn dispatch(command: Commands, mut cfg: HarnessConfig) -> Result<()> {
    match command {
        Commands::Run(opts) => {
            opts.apply_to(&mut cfg);
            let spec = opts.to_spec(&cfg)?;
            let device = AdbDevice::from_config(&cfg);
            run_poc_workflow(&device, &cfg, &spec, opts.json).map(|_| ())
        }
        Commands::Pids(opts) => {
            let device = AdbDevice::from_config(&cfg);
            list_processes(&device, &cfg, &opts.pattern, opts.single).map(|_| ())
        }
        Commands::KillAll(opts) => {
            let device = AdbDevice::from_config(&cfg);
            let timeout = Duration::from_secs(opts.timeout);
            kill_all_workflow(&device, &cfg, &opts.pattern, opts.expect, timeout).map(|_| ())
        }
        Commands::Frida(opts) => {
            opts.apply_to(&mut cfg);
            let target = match (&opts.pid, &opts.spawn) {
                (Some(pid), _) => FridaTarget::Pid(*pid),
                (None, Some(program)) => FridaTarget::Spawn(program.clone()),
                (None, None) => {
                    return Err(HarnessError::ConfigError(
                        "frida needs --pid or --spawn".to_string(),
                    ))
                }
            };
            let device = AdbDevice::from_config(&cfg);
            let fetcher = GithubReleaseFetcher::new()?;
            let hold = opts.duration.map(Duration::from_secs);
            frida_workflow(&device, &cfg, &fetcher, &target, &opts.script, hold).map(|_| ())
        }
        Commands::Rootcanal(opts) => {
            let device = AdbDevice::from_config(&cfg);
            let hold = opts.hold.map(Duration::from_secs);
            rootcanal_workflow(&device, &cfg, &opts.binary, opts.port, hold).map(|_| ())
        }
    }
}
