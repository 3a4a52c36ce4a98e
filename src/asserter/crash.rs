use tracing::{debug, info};

use super::{AssertContext, AssertScope, Asserter};
use crate::crash::{parse_crash_log, security_crashes};
use crate::device::Device;
use crate::error::{HarnessError, Result};

/// Fails the run when a watched process produced a security-relevant native
/// crash while the PoC ran.
#[derive(Clone, Debug, Default)]
pub struct CrashAsserter {
    process_patterns: Vec<String>,
}

impl CrashAsserter {
    /// Watch the PoC process itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also (or instead of the PoC) watch processes whose name contains
    /// `pattern`, e.g. the service the PoC attacks.
    pub fn with_process(mut self, pattern: impl Into<String>) -> Self {
        self.process_patterns.push(pattern.into());
        self
    }
}

impl Asserter for CrashAsserter {
    fn arm(&self, device: &dyn Device, ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>> {
        device.shell_checked("logcat -c -b crash")?;
        let patterns = if self.process_patterns.is_empty() {
            vec![ctx.poc_name.to_string()]
        } else {
            self.process_patterns.clone()
        };
        debug!("watching crashes of {patterns:?}");
        Ok(Box::new(CrashScope { patterns }))
    }
}

struct CrashScope {
    patterns: Vec<String>,
}

impl AssertScope for CrashScope {
    fn release(self: Box<Self>, device: &dyn Device) -> Result<()> {
        let log = device.shell_checked("logcat -d -b crash")?;
        let crashes = parse_crash_log(&log);
        if !crashes.is_empty() {
            info!("{} native crash(es) in crash buffer", crashes.len());
        }
        let relevant = security_crashes(&crashes, &self.patterns);
        if relevant.is_empty() {
            return Ok(());
        }
        let details: Vec<String> = relevant.iter().map(|c| c.summary()).collect();
        Err(HarnessError::AssertionFailed(format!(
            "security-relevant crash detected:\n{}",
            details.join("\n")
        )))
    }
}
