//! Security assertions wrapped around a PoC run
//!
//! An [`Asserter`] is armed before the PoC runs and yields an [`AssertScope`].
//! The scope's release may itself fail with an assertion, since evidence such
//! as crash dumps or allocator reports is only complete after the run.

mod composite;
mod crash;
mod exit_code;
mod malloc;

use crate::device::{CommandOutcome, Device};
use crate::error::Result;

pub use composite::CompositeAsserter;
pub use crash::CrashAsserter;
pub use exit_code::ExitCodeAsserter;
pub use malloc::MallocDebugAsserter;

/// What an asserter knows about the run it is wrapping.
#[derive(Clone, Debug)]
pub struct AssertContext<'a> {
    /// Executable name without bitness suffix.
    pub poc_name: &'a str,
    /// Absolute path of the binary on the device.
    pub remote_binary: &'a str,
}

pub trait Asserter {
    /// Prepare the device and return the scope to release after the run.
    fn arm(&self, device: &dyn Device, ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>>;

    /// Inspect the command outcome before the scope is released.
    fn check_outcome(&self, _outcome: &CommandOutcome) -> Result<()> {
        Ok(())
    }
}

pub trait AssertScope {
    fn release(self: Box<Self>, device: &dyn Device) -> Result<()>;
}

/// Scope with nothing to undo.
pub struct EmptyScope;

impl AssertScope for EmptyScope {
    fn release(self: Box<Self>, _device: &dyn Device) -> Result<()> {
        Ok(())
    }
}

/// Asserts nothing. The default for a PoC that only needs to run.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAsserter;

impl Asserter for NoopAsserter {
    fn arm(&self, _device: &dyn Device, _ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>> {
        Ok(Box::new(EmptyScope))
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> AssertContext<'static> {
    AssertContext {
        poc_name: "poc_cve_x",
        remote_binary: "/data/local/tmp/poc_cve_x",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;

    #[test]
    fn noop_arms_and_releases() {
        let device = FakeDevice::new();
        let scope = NoopAsserter.arm(&device, &test_context()).unwrap();
        NoopAsserter
            .check_outcome(&CommandOutcome::completed(1, "", ""))
            .unwrap();
        scope.release(&device).unwrap();
        assert!(device.commands().is_empty());
    }
}
