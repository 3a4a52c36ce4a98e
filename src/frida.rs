//! frida-inject deployment
//!
//! A [`DynamicInstrumentationSession`] pushes a frida-inject build matching the
//! device ABI, uploads scripts and launches the injector in the background
//! against a pid or a spawned program. Everything it starts or uploads is
//! torn down on [`DynamicInstrumentationSession::close`], or on drop as a
//! fallback.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::config::{remote_path, HarnessConfig};
use crate::device::{shell_quote, BackgroundCommand, Device};
use crate::error::{first_error, HarnessError, Result};
use crate::process::{KillFailure, KillOutcome, ProcessRegistry};
use crate::scope::UploadedArtifact;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of frida-inject binaries.
pub trait ReleaseFetcher {
    /// Decompressed frida-inject executable for `version` and frida `arch`.
    fn fetch(&self, version: &str, arch: &str) -> Result<Vec<u8>>;
}

/// Release asset name, e.g. `frida-inject-16.5.9-android-arm64.xz`.
pub fn asset_name(version: &str, arch: &str) -> String {
    format!("frida-inject-{version}-android-{arch}.xz")
}

#[cfg(feature = "download")]
mod github {
    use std::io::Read;

    use reqwest::blocking::Client;
    use serde::Deserialize;

    use super::{asset_name, ReleaseFetcher};
    use crate::error::{HarnessError, Result};

    pub const GITHUB_API: &str = "https://api.github.com";

    #[derive(Debug, Deserialize)]
    pub(super) struct Release {
        #[serde(default)]
        pub assets: Vec<Asset>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Asset {
        pub name: String,
        pub browser_download_url: String,
    }

    impl Release {
        pub fn asset_url(&self, name: &str) -> Option<&str> {
            self.assets
                .iter()
                .find(|asset| asset.name == name)
                .map(|asset| asset.browser_download_url.as_str())
        }
    }

    /// Downloads frida-inject from the frida GitHub releases.
    pub struct GithubReleaseFetcher {
        client: Client,
        api_base: String,
    }

    impl GithubReleaseFetcher {
        pub fn new() -> Result<Self> {
            Self::with_api_base(GITHUB_API)
        }

        pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
            let client = Client::builder()
                .user_agent(concat!("poc-harness/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|err| HarnessError::DownloadFailed(format!("http client: {err}")))?;
            Ok(Self {
                client,
                api_base: api_base.into(),
            })
        }
    }

    impl ReleaseFetcher for GithubReleaseFetcher {
        fn fetch(&self, version: &str, arch: &str) -> Result<Vec<u8>> {
            let url = format!("{}/repos/frida/frida/releases/tags/{version}", self.api_base);
            let fail = |what: &str, err: reqwest::Error| {
                HarnessError::DownloadFailed(format!("{what}: {err}"))
            };
            let release: Release = self
                .client
                .get(&url)
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(|err| fail(url.as_str(), err))?
                .json()
                .map_err(|err| fail("release metadata", err))?;

            let name = asset_name(version, arch);
            let asset_url = release.asset_url(&name).ok_or_else(|| {
                HarnessError::DownloadFailed(format!("release {version} has no asset {name}"))
            })?;
            tracing::info!("downloading {asset_url}");
            let compressed = self
                .client
                .get(asset_url)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|err| fail(asset_url, err))?;

            let mut binary = Vec::new();
            xz2::read::XzDecoder::new(compressed.as_ref())
                .read_to_end(&mut binary)
                .map_err(|err| HarnessError::DownloadFailed(format!("decompress {name}: {err}")))?;
            Ok(binary)
        }
    }
}

#[cfg(feature = "download")]
pub use github::GithubReleaseFetcher;

/// Placeholder used when the crate is built without network support.
#[cfg(not(feature = "download"))]
pub struct GithubReleaseFetcher;

#[cfg(not(feature = "download"))]
impl GithubReleaseFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

#[cfg(not(feature = "download"))]
impl ReleaseFetcher for GithubReleaseFetcher {
    fn fetch(&self, version: &str, arch: &str) -> Result<Vec<u8>> {
        Err(HarnessError::DownloadFailed(format!(
            "{} is not cached and this build has no `download` feature",
            asset_name(version, arch)
        )))
    }
}

/// Local path of the cached injector, fetching it on first use.
pub fn ensure_cached(
    fetcher: &dyn ReleaseFetcher,
    cache_dir: &Path,
    version: &str,
    arch: &str,
) -> Result<PathBuf> {
    let path = cache_dir.join(format!("frida-inject-{version}-android-{arch}"));
    if path.is_file() {
        debug!("using cached {}", path.display());
        return Ok(path);
    }
    let binary = fetcher.fetch(version, arch)?;
    fs::create_dir_all(cache_dir)
        .map_err(|err| HarnessError::from_io_error(cache_dir.display().to_string(), err))?;

    let io_err = |err| HarnessError::from_io_error(path.display().to_string(), err);
    let mut staged = tempfile::NamedTempFile::new_in(cache_dir).map_err(io_err)?;
    staged.write_all(&binary).map_err(io_err)?;
    staged.persist(&path).map_err(|err| io_err(err.error))?;
    info!("cached {}", path.display());
    Ok(path)
}

struct Injector {
    pid: i32,
    command: Box<dyn BackgroundCommand>,
}

pub struct DynamicInstrumentationSession<'d> {
    device: &'d dyn Device,
    staging_dir: String,
    injector_name: String,
    start_timeout: Duration,
    poll_interval: Duration,
    uploads: Vec<UploadedArtifact>,
    injectors: Vec<Injector>,
    closed: bool,
}

impl<'d> DynamicInstrumentationSession<'d> {
    pub fn open(device: &'d dyn Device, cfg: &HarnessConfig, fetcher: &dyn ReleaseFetcher) -> Result<Self> {
        let abis = device.abis()?;
        let arch = abis
            .iter()
            .find_map(|abi| abi.frida_arch())
            .ok_or_else(|| {
                HarnessError::SetupFailed(format!("no frida build for device ABIs {abis:?}"))
            })?;
        let version = &cfg.frida.version;
        let local = ensure_cached(fetcher, &cfg.frida.cache_dir, version, arch)?;

        let mut session = Self {
            device,
            staging_dir: cfg.staging_dir.clone(),
            injector_name: format!("frida-inject-{version}"),
            start_timeout: cfg.frida.start_timeout,
            poll_interval: cfg.poll_interval,
            uploads: Vec::new(),
            injectors: Vec::new(),
            closed: false,
        };
        let remote = remote_path(&session.staging_dir, &session.injector_name);
        session
            .uploads
            .push(UploadedArtifact::new(Some(local.clone()), remote.clone()));
        device.push_file(&local, &remote)?;
        device.shell_checked(&format!("chmod 755 {}", shell_quote(&remote)))?;
        info!("frida-inject {version} ({arch}) ready at {remote}");
        Ok(session)
    }

    fn upload_script(&mut self, script: &str) -> Result<String> {
        let name = format!("poc-harness-{:08x}.js", rand::random::<u32>());
        let remote = remote_path(&self.staging_dir, &name);
        let mut local = tempfile::Builder::new()
            .suffix(".js")
            .tempfile()
            .map_err(|err| HarnessError::from_io_error("temporary script", err))?;
        local
            .write_all(script.as_bytes())
            .map_err(|err| HarnessError::from_io_error(local.path().display().to_string(), err))?;
        self.uploads.push(UploadedArtifact::new(None, remote.clone()));
        self.device.push_file(local.path(), &remote)?;
        Ok(remote)
    }

    /// `target` is the shell-quoted injector argument; `target_pattern` is how
    /// it appears in the process command line.
    fn launch(&mut self, target: &str, target_pattern: &str, script: &str) -> Result<i32> {
        let script_remote = self.upload_script(script)?;
        let command = format!(
            "cd {}; ./{} {target} -s {} -e",
            shell_quote(&self.staging_dir),
            self.injector_name,
            shell_quote(&script_remote)
        );
        let background = self.device.execute_shell_background(&command)?;

        let pattern = format!("{} {target_pattern}", self.injector_name);
        let registry = ProcessRegistry::new(self.device).with_poll_interval(self.poll_interval);
        let known: BTreeSet<i32> = self.injectors.iter().map(|i| i.pid).collect();
        let started = registry.wait_until_running(&pattern, self.start_timeout);
        let pid = match started {
            Ok(found) => found.keys().rev().copied().find(|pid| !known.contains(pid)),
            Err(err) => {
                warn!("injector output:\n{}", background.output());
                background.stop();
                return Err(err);
            }
        };
        let Some(pid) = pid else {
            background.stop();
            return Err(HarnessError::SetupFailed(format!(
                "no new injector process matching '{pattern}'"
            )));
        };
        info!("frida-inject running as pid {pid}");
        self.injectors.push(Injector {
            pid,
            command: background,
        });
        Ok(pid)
    }

    /// Inject `script` into the running process `pid`. Returns the injector pid.
    pub fn attach(&mut self, pid: i32, script: &str) -> Result<i32> {
        let target = format!("-p {pid}");
        self.launch(&target, &target, script)
    }

    /// Spawn `program` under the injector with `script` loaded.
    pub fn spawn(&mut self, program: &str, script: &str) -> Result<i32> {
        self.launch(
            &format!("-f {}", shell_quote(program)),
            &format!("-f {program}"),
            script,
        )
    }

    /// Output of every injector started so far.
    pub fn output(&self) -> String {
        self.injectors
            .iter()
            .map(|i| i.command.output())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn injector_pids(&self) -> Vec<i32> {
        self.injectors.iter().map(|i| i.pid).collect()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let registry = ProcessRegistry::new(self.device).with_poll_interval(self.poll_interval);
        let mut results = Vec::new();
        while let Some(injector) = self.injectors.pop() {
            let killed = match registry.kill(injector.pid, Signal::SIGKILL, KILL_TIMEOUT) {
                KillOutcome::Success | KillOutcome::Failed(KillFailure::NoSuchProcess) => Ok(()),
                KillOutcome::Failed(reason) => Err(HarnessError::KillFailed {
                    pid: injector.pid,
                    reason,
                }),
            };
            injector.command.stop();
            results.push(killed);
        }
        while let Some(artifact) = self.uploads.pop() {
            results.push(artifact.delete(self.device));
        }
        first_error(results)
    }

    /// Kill every injector and delete every uploaded file.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for DynamicInstrumentationSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("frida session cleanup failed: {err}");
        }
    }
}
