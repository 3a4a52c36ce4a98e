use super::{AssertContext, AssertScope, Asserter};
use crate::config::DEFAULT_MALLOC_DEBUG_OPTIONS;
use crate::device::Device;
use crate::error::Result;
use crate::malloc_debug::{MallocDebugConfig, MallocDebugSession};

/// Runs the PoC, or a named service, under libc malloc debug and fails on
/// any reported heap corruption.
#[derive(Clone, Debug)]
pub struct MallocDebugAsserter {
    options: String,
    service: Option<String>,
}

impl MallocDebugAsserter {
    /// Instrument the PoC binary itself.
    pub fn for_poc() -> Self {
        Self {
            options: DEFAULT_MALLOC_DEBUG_OPTIONS.to_string(),
            service: None,
        }
    }

    /// Instrument a running service; it is restarted on arm and release.
    pub fn for_service(process: impl Into<String>) -> Self {
        Self {
            options: DEFAULT_MALLOC_DEBUG_OPTIONS.to_string(),
            service: Some(process.into()),
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }
}

impl Asserter for MallocDebugAsserter {
    fn arm(&self, device: &dyn Device, ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>> {
        let config = match &self.service {
            Some(service) => MallocDebugConfig::new(&self.options, service, true),
            None => MallocDebugConfig::new(&self.options, ctx.poc_name, false),
        };
        Ok(Box::new(MallocDebugSession::open(device, config)?))
    }
}

impl AssertScope for MallocDebugSession {
    fn release(self: Box<Self>, device: &dyn Device) -> Result<()> {
        MallocDebugSession::release(*self, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asserter::test_context;
    use crate::device::fake::FakeDevice;
    use crate::malloc_debug::{OPTIONS_PROPERTY, PROGRAM_PROPERTY};

    #[test]
    fn poc_mode_targets_poc_name() {
        let device = FakeDevice::new();
        let scope = MallocDebugAsserter::for_poc()
            .with_options("guard")
            .arm(&device, &test_context())
            .unwrap();
        assert_eq!(device.prop(PROGRAM_PROPERTY).as_deref(), Some("poc_cve_x"));
        assert_eq!(device.prop(OPTIONS_PROPERTY).as_deref(), Some("guard"));
        scope.release(&device).unwrap();
        assert_eq!(device.prop(OPTIONS_PROPERTY), None);
    }

    #[test]
    fn missing_service_is_skipped() {
        let device = FakeDevice::new();
        let err = MallocDebugAsserter::for_service("ghost_service")
            .arm(&device, &test_context())
            .err()
            .unwrap();
        assert!(err.is_skip());
        assert_eq!(device.prop(OPTIONS_PROPERTY), None);
    }
}
