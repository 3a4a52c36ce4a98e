use tracing::warn;

use super::{AssertContext, AssertScope, Asserter};
use crate::device::{CommandOutcome, Device};
use crate::error::{first_error, Result};

/// Several asserters armed in order and released in reverse.
#[derive(Default)]
pub struct CompositeAsserter {
    asserters: Vec<Box<dyn Asserter>>,
}

impl CompositeAsserter {
    pub fn new(asserters: Vec<Box<dyn Asserter>>) -> Self {
        Self { asserters }
    }

    pub fn with(mut self, asserter: impl Asserter + 'static) -> Self {
        self.asserters.push(Box::new(asserter));
        self
    }

    pub fn len(&self) -> usize {
        self.asserters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asserters.is_empty()
    }
}

impl Asserter for CompositeAsserter {
    fn arm(&self, device: &dyn Device, ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>> {
        let mut scope = CompositeScope { scopes: Vec::new() };
        for asserter in &self.asserters {
            match asserter.arm(device, ctx) {
                Ok(armed) => scope.scopes.push(armed),
                Err(err) => {
                    if let Err(release_err) = Box::new(scope).release(device) {
                        warn!("releasing partially armed asserters failed: {release_err}");
                    }
                    return Err(err);
                }
            }
        }
        Ok(Box::new(scope))
    }

    fn check_outcome(&self, outcome: &CommandOutcome) -> Result<()> {
        first_error(self.asserters.iter().map(|a| a.check_outcome(outcome)))
    }
}

struct CompositeScope {
    scopes: Vec<Box<dyn AssertScope>>,
}

impl AssertScope for CompositeScope {
    fn release(self: Box<Self>, device: &dyn Device) -> Result<()> {
        first_error(self.scopes.into_iter().rev().map(|s| s.release(device)))
    }
}
