//! Native PoC execution
//!
//! [`NativePocRunner::run`] walks one PoC through
//! `Built → Pushed → ResourcesUploaded → AsserterArmed → Running → Completed → Cleaned`.
//! Everything pushed is deleted again, the asserter scope is always released,
//! and the first failure wins: a failure of the run itself is reported ahead
//! of any cleanup failure.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::asserter::{AssertContext, AssertScope, Asserter, NoopAsserter};
use crate::config::{remote_path, HarnessConfig, DEFAULT_POC_TIMEOUT_SECS, DEFAULT_STAGING_DIR};
use crate::device::{shell_quote, Abi, CommandOutcome, CommandStatus, Device};
use crate::error::{first_error, HarnessError, Result};
use crate::scope::UploadedArtifact;

/// Which build of the PoC to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Bitness {
    /// Follow the device's preferred ABI, falling back to the other width
    /// when only that build exists.
    #[default]
    Auto,
    Only32,
    Only64,
}

impl Bitness {
    /// Widths to try, most preferred first, limited to what the device runs.
    pub fn candidates(self, abis: &[Abi]) -> Vec<u32> {
        let mut supported: Vec<u32> = Vec::new();
        for abi in abis {
            if !supported.contains(&abi.bits()) {
                supported.push(abi.bits());
            }
        }
        match self {
            Bitness::Auto => supported,
            Bitness::Only32 => supported.into_iter().filter(|b| *b == 32).collect(),
            Bitness::Only64 => supported.into_iter().filter(|b| *b == 64).collect(),
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitness::Auto => write!(f, "auto"),
            Bitness::Only32 => write!(f, "32-bit"),
            Bitness::Only64 => write!(f, "64-bit"),
        }
    }
}

/// Source of the data files a PoC needs on the device.
pub trait ResourceStore {
    fn read(&self, name: &str) -> Result<Vec<u8>>;
}

/// Resources stored as files below a local directory.
#[derive(Clone, Debug)]
pub struct DirResourceStore {
    root: PathBuf,
}

impl DirResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceStore for DirResourceStore {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.root.join(name);
        fs::read(&path).map_err(|err| HarnessError::from_io_error(path.display().to_string(), err))
    }
}

/// Resources compiled into the harness or assembled at runtime.
#[derive(Clone, Debug, Default)]
pub struct EmbeddedResources {
    entries: BTreeMap<String, Vec<u8>>,
}

impl EmbeddedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.entries.insert(name.into(), data.into());
    }
}

impl ResourceStore for EmbeddedResources {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::SetupFailed(format!("resource '{name}' is not embedded")))
    }
}

/// Called with the outcome after the PoC exits and before assertions run.
pub type PostRun = Box<dyn Fn(&dyn Device, &CommandOutcome) -> Result<()>>;

/// Immutable description of one PoC invocation. Build with [`PocSpec::builder`].
pub struct PocSpec {
    name: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    use_default_library_path: bool,
    timeout_secs: u64,
    resources: Vec<String>,
    resource_upload_dir: String,
    bitness: Bitness,
    post_run: Option<PostRun>,
    asserter: Box<dyn Asserter>,
    require_success: bool,
}

impl PocSpec {
    pub fn builder(name: impl Into<String>) -> PocSpecBuilder {
        PocSpecBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn require_success(&self) -> bool {
        self.require_success
    }

    /// Local file name for a given width, e.g. `poc_cve_x_sts64`.
    pub fn local_binary_name(&self, bits: u32) -> String {
        format!("{}_sts{bits}", self.name)
    }

    /// Shell command line run from the staging directory.
    pub fn command_line(&self, staging_dir: &str, bits: u32) -> String {
        let mut env = self.env.clone();
        if self.use_default_library_path && !env.contains_key("LD_LIBRARY_PATH") {
            let lib = if bits == 64 { "/system/lib64" } else { "/system/lib" };
            env.insert("LD_LIBRARY_PATH".to_string(), lib.to_string());
        }

        let mut command = format!("cd {}; ", shell_quote(staging_dir));
        for (key, value) in &env {
            command.push_str(&format!("{key}={} ", shell_quote(value)));
        }
        command.push_str("./");
        command.push_str(&self.name);
        for arg in &self.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        command
    }
}

impl fmt::Debug for PocSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PocSpec")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("timeout_secs", &self.timeout_secs)
            .field("resources", &self.resources)
            .field("bitness", &self.bitness)
            .field("require_success", &self.require_success)
            .finish_non_exhaustive()
    }
}

pub struct PocSpecBuilder {
    spec: PocSpec,
}

impl PocSpecBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            spec: PocSpec {
                name: name.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                use_default_library_path: true,
                timeout_secs: DEFAULT_POC_TIMEOUT_SECS,
                resources: Vec::new(),
                resource_upload_dir: DEFAULT_STAGING_DIR.to_string(),
                bitness: Bitness::Auto,
                post_run: None,
                asserter: Box::new(NoopAsserter),
                require_success: false,
            },
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    pub fn use_default_library_path(mut self, enabled: bool) -> Self {
        self.spec.use_default_library_path = enabled;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.spec.timeout_secs = secs;
        self
    }

    pub fn resource(mut self, name: impl Into<String>) -> Self {
        self.spec.resources.push(name.into());
        self
    }

    pub fn resource_upload_dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.resource_upload_dir = dir.into();
        self
    }

    pub fn bitness(mut self, bitness: Bitness) -> Self {
        self.spec.bitness = bitness;
        self
    }

    pub fn only32(self) -> Self {
        self.bitness(Bitness::Only32)
    }

    pub fn only64(self) -> Self {
        self.bitness(Bitness::Only64)
    }

    pub fn after<F>(mut self, post_run: F) -> Self
    where
        F: Fn(&dyn Device, &CommandOutcome) -> Result<()> + 'static,
    {
        self.spec.post_run = Some(Box::new(post_run));
        self
    }

    pub fn asserter(mut self, asserter: impl Asserter + 'static) -> Self {
        self.spec.asserter = Box::new(asserter);
        self
    }

    pub fn boxed_asserter(mut self, asserter: Box<dyn Asserter>) -> Self {
        self.spec.asserter = asserter;
        self
    }

    pub fn require_success(mut self, required: bool) -> Self {
        self.spec.require_success = required;
        self
    }

    pub fn build(self) -> Result<PocSpec> {
        let spec = self.spec;
        if spec.name.trim().is_empty() {
            return Err(HarnessError::ConfigError("PoC name must not be empty".to_string()));
        }
        if spec.name.contains('/') {
            return Err(HarnessError::ConfigError(format!(
                "PoC name '{}' must be a bare file name",
                spec.name
            )));
        }
        if spec.timeout_secs == 0 {
            return Err(HarnessError::ConfigError("timeout_secs must be positive".to_string()));
        }
        if let Some(key) = spec.env.keys().find(|k| !is_env_name(k)) {
            return Err(HarnessError::ConfigError(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        Ok(spec)
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Lifecycle stages of a run, recorded in [`RunReport::state_trail`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunState {
    Built,
    Pushed,
    ResourcesUploaded,
    AsserterArmed,
    Running,
    Completed,
    Cleaned,
}

/// Summary of a successful run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub outcome: CommandOutcome,
    pub state_trail: Vec<RunState>,
    pub bits: u32,
    /// Every file pushed during the run; all of them were deleted.
    pub pushed: Vec<UploadedArtifact>,
}

struct PushedBinary {
    artifact: UploadedArtifact,
    bits: u32,
}

pub struct NativePocRunner<'d> {
    device: &'d dyn Device,
    staging_dir: String,
    poc_dirs: Vec<PathBuf>,
    resources: Box<dyn ResourceStore>,
}

impl<'d> NativePocRunner<'d> {
    pub fn new(device: &'d dyn Device, cfg: &HarnessConfig) -> Self {
        let resources: Box<dyn ResourceStore> = match &cfg.resource_dir {
            Some(dir) => Box::new(DirResourceStore::new(dir)),
            None => Box::new(EmbeddedResources::new()),
        };
        Self {
            device,
            staging_dir: cfg.staging_dir.clone(),
            poc_dirs: cfg.poc_dirs.clone(),
            resources,
        }
    }

    pub fn with_resources(mut self, store: impl ResourceStore + 'static) -> Self {
        self.resources = Box::new(store);
        self
    }

    pub fn run(&self, spec: &PocSpec) -> Result<RunReport> {
        let mut trail = vec![RunState::Built];
        let binary = self.push_binary(spec)?;
        trail.push(RunState::Pushed);

        let mut uploaded = Vec::new();
        let mut scope = None;
        let primary = self.stage_and_execute(spec, &binary, &mut trail, &mut uploaded, &mut scope);
        let cleanup = self.cleanup(scope, &uploaded, &binary.artifact);
        trail.push(RunState::Cleaned);
        debug!("{} state trail: {trail:?}", spec.name);

        let outcome = match (primary, cleanup) {
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!("cleanup after failed run of {} also failed: {cleanup_err}", spec.name);
                }
                return Err(err);
            }
            (Ok(_), Err(err)) => return Err(err),
            (Ok(outcome), Ok(())) => outcome,
        };
        self.translate(spec, &outcome)?;

        let mut pushed = vec![binary.artifact];
        pushed.extend(uploaded);
        Ok(RunReport {
            outcome,
            state_trail: trail,
            bits: binary.bits,
            pushed,
        })
    }

    fn locate_binary(&self, spec: &PocSpec, candidates: &[u32]) -> Option<(PathBuf, u32)> {
        candidates.iter().find_map(|bits| {
            let file = spec.local_binary_name(*bits);
            self.poc_dirs
                .iter()
                .map(|dir| dir.join(&file))
                .find(|path| path.is_file())
                .map(|path| (path, *bits))
        })
    }

    fn push_binary(&self, spec: &PocSpec) -> Result<PushedBinary> {
        let abis = self.device.abis()?;
        let candidates = spec.bitness.candidates(&abis);
        if candidates.is_empty() {
            return Err(HarnessError::Skipped(format!(
                "{} requires a {} ABI; device supports {:?}",
                spec.name,
                spec.bitness,
                abis.iter().map(Abi::as_str).collect::<Vec<_>>()
            )));
        }
        let (local, bits) = self.locate_binary(spec, &candidates).ok_or_else(|| {
            let names: Vec<String> = candidates.iter().map(|b| spec.local_binary_name(*b)).collect();
            HarnessError::SetupFailed(format!(
                "none of {names:?} found in {:?}",
                self.poc_dirs
            ))
        })?;

        let remote = remote_path(&self.staging_dir, &spec.name);
        info!("pushing {} -> {remote}", local.display());
        let prepared = self
            .device
            .push_file(&local, &remote)
            .and_then(|()| self.prepare_binary(&remote));
        if let Err(err) = prepared {
            if let Err(delete_err) = self.device.delete_file(&remote) {
                warn!("failed to remove {remote}: {delete_err}");
            }
            return Err(err);
        }
        Ok(PushedBinary {
            artifact: UploadedArtifact::new(Some(local), remote),
            bits,
        })
    }

    fn prepare_binary(&self, remote: &str) -> Result<()> {
        let quoted = shell_quote(remote);
        self.device.shell_checked(&format!("chmod 777 {quoted}"))?;
        for (flag, what) in [("-r", "readable"), ("-w", "writable"), ("-x", "executable")] {
            if !self.device.shell(&format!("test {flag} {quoted}")).is_success() {
                return Err(HarnessError::SetupFailed(format!("{remote} is not {what}")));
            }
        }
        Ok(())
    }

    fn upload_resources(&self, spec: &PocSpec, uploaded: &mut Vec<UploadedArtifact>) -> Result<()> {
        for name in &spec.resources {
            let data = self.resources.read(name)?;
            let file_name = Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            let remote = remote_path(&spec.resource_upload_dir, &file_name);

            let mut temp = tempfile::NamedTempFile::new()
                .map_err(|err| HarnessError::from_io_error("temporary resource file", err))?;
            temp.write_all(&data)
                .map_err(|err| HarnessError::from_io_error(temp.path().display().to_string(), err))?;
            uploaded.push(UploadedArtifact::new(None, remote.clone()));
            debug!("uploading resource {name} -> {remote}");
            self.device.push_file(temp.path(), &remote)?;
        }
        Ok(())
    }

    fn stage_and_execute(
        &self,
        spec: &PocSpec,
        binary: &PushedBinary,
        trail: &mut Vec<RunState>,
        uploaded: &mut Vec<UploadedArtifact>,
        scope: &mut Option<Box<dyn AssertScope>>,
    ) -> Result<CommandOutcome> {
        self.upload_resources(spec, uploaded)?;
        trail.push(RunState::ResourcesUploaded);

        let ctx = AssertContext {
            poc_name: &spec.name,
            remote_binary: &binary.artifact.remote_path,
        };
        *scope = Some(spec.asserter.arm(self.device, &ctx)?);
        trail.push(RunState::AsserterArmed);

        let command = spec.command_line(&self.staging_dir, binary.bits);
        info!("running {command}");
        trail.push(RunState::Running);
        let outcome = self
            .device
            .execute_shell(&command, Duration::from_secs(spec.timeout_secs), 0);
        trail.push(RunState::Completed);
        debug!(
            "{} finished: {:?} exit {:?}",
            spec.name, outcome.status, outcome.exit_code
        );

        if let Some(post_run) = &spec.post_run {
            post_run(self.device, &outcome)?;
        }
        spec.asserter.check_outcome(&outcome)?;
        Ok(outcome)
    }

    fn cleanup(
        &self,
        scope: Option<Box<dyn AssertScope>>,
        uploaded: &[UploadedArtifact],
        binary: &UploadedArtifact,
    ) -> Result<()> {
        let released = match scope {
            Some(scope) => scope.release(self.device),
            None => Ok(()),
        };
        let resources = first_error(uploaded.iter().rev().map(|r| r.delete(self.device)));
        let binary = binary.delete(self.device);
        first_error([released, resources, binary])
    }

    fn translate(&self, spec: &PocSpec, outcome: &CommandOutcome) -> Result<()> {
        match outcome.status {
            CommandStatus::TimedOut => Err(HarnessError::Skipped(format!(
                "{} timed out after {}s; consider raising timeout_secs",
                spec.name, spec.timeout_secs
            ))),
            CommandStatus::Exception => Err(HarnessError::Transport {
                command: spec.name.clone(),
                reason: outcome.stderr.clone(),
            }),
            CommandStatus::Failed if spec.require_success => Err(HarnessError::Skipped(format!(
                "{} exited with {:?} but success was required\nstderr:\n{}",
                spec.name, outcome.exit_code, outcome.stderr
            ))),
            _ => Ok(()),
        }
    }
}
