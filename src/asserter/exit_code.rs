use super::{AssertContext, AssertScope, Asserter, EmptyScope};
use crate::config::VULNERABLE_EXIT_CODE;
use crate::device::{CommandOutcome, Device};
use crate::error::{HarnessError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expectation {
    Equals(i32),
    NotEquals(i32),
}

/// Checks the PoC exit code. Runs that did not complete (timeout, transport
/// failure) carry no exit code and are left to the runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitCodeAsserter {
    expectation: Expectation,
}

impl ExitCodeAsserter {
    pub fn equals(code: i32) -> Self {
        Self {
            expectation: Expectation::Equals(code),
        }
    }

    pub fn not_equals(code: i32) -> Self {
        Self {
            expectation: Expectation::NotEquals(code),
        }
    }

    /// PoCs exit with [`VULNERABLE_EXIT_CODE`] when the bug reproduced.
    pub fn assert_not_vulnerable_exit_code() -> Self {
        Self::not_equals(VULNERABLE_EXIT_CODE)
    }
}

impl Asserter for ExitCodeAsserter {
    fn arm(&self, _device: &dyn Device, _ctx: &AssertContext<'_>) -> Result<Box<dyn AssertScope>> {
        Ok(Box::new(EmptyScope))
    }

    fn check_outcome(&self, outcome: &CommandOutcome) -> Result<()> {
        let Some(code) = outcome.exit_code.filter(|_| outcome.has_exit_code()) else {
            return Ok(());
        };
        match self.expectation {
            Expectation::Equals(expected) if code != expected => Err(HarnessError::rejected(
                format!("expected exit code {expected}, got {code}"),
                outcome,
            )),
            Expectation::NotEquals(forbidden) if code == forbidden => {
                let message = if forbidden == VULNERABLE_EXIT_CODE {
                    format!("PoC exited with {code}: the device is vulnerable")
                } else {
                    format!("exit code must not be {forbidden}")
                };
                Err(HarnessError::rejected(message, outcome))
            }
            _ => Ok(()),
        }
    }
}
