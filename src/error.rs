//! Unified error handling for poc-harness
//!
//! Every failure is classified into one of three categories so that a flaky
//! device is never reported as a security regression:
//! - [`ErrorKind::SetupFailure`]: pushing, permissions or configuration failed
//!   before the PoC ran
//! - [`ErrorKind::EnvironmentFlake`]: timeouts, transport hiccups, assumption
//!   failures; reported as a skip
//! - [`ErrorKind::AssertionViolation`]: a crash, malloc-debug finding or wrong
//!   exit code; the only category that fails a run definitively

use std::io;
use thiserror::Error;

use crate::device::CommandOutcome;
use crate::process::KillFailure;

/// Category of a [`HarnessError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SetupFailure,
    EnvironmentFlake,
    AssertionViolation,
}

/// How a test runner should report an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Fail,
    Skip,
}

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Artifact push, chmod or permission verification failed
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    /// The device shell could not be reached or the command could not start
    #[error("Transport error while running `{command}`: {reason}")]
    Transport { command: String, reason: String },

    /// Device did not come back within the allotted time
    #[error("Device {serial} unavailable after {timeout_secs}s")]
    DeviceUnavailable { serial: String, timeout_secs: u64 },

    /// Environment precondition not met; the test should be skipped
    #[error("Skipped: {0}")]
    Skipped(String),

    /// A security property was violated
    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    /// An asserter rejected the command outcome
    #[error("{message}\nexit code: {exit_code:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    OutcomeRejected {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// More than one process matched a pattern expected to be unique
    #[error("Pattern '{pattern}' matched multiple processes: {pids:?}")]
    AmbiguousProcess { pattern: String, pids: Vec<i32> },

    /// The remote process query tool itself failed
    #[error("Process query for '{pattern}' failed: {reason}")]
    ProcessQueryFailed { pattern: String, reason: String },

    /// A polling wait ran past its deadline
    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    WaitTimeout { what: String, timeout_ms: u64 },

    /// Signal delivery failed for a reason that is not tolerated here
    #[error("Failed to kill pid {pid}: {reason:?}")]
    KillFailed { pid: i32, reason: KillFailure },

    /// `kill_all` was required to find at least one process
    #[error("Expected to kill processes matching '{0}' but none were found")]
    ExpectedProcessNotFound(String),

    /// Another malloc debug session owns the device
    #[error("Malloc debug property {property} is already set to '{value}'")]
    MallocDebugAlreadyActive { property: String, value: String },

    /// Local file I/O error
    #[error("File I/O error for '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Instrumentation binary could not be fetched
    #[error("Download error: {0}")]
    DownloadFailed(String),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Generic error for cases not covered above
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::AssertionFailed(_)
            | HarnessError::OutcomeRejected { .. }
            | HarnessError::ExpectedProcessNotFound(_) => ErrorKind::AssertionViolation,
            HarnessError::Transport { .. }
            | HarnessError::DeviceUnavailable { .. }
            | HarnessError::Skipped(_)
            | HarnessError::WaitTimeout { .. }
            | HarnessError::ProcessQueryFailed { .. } => ErrorKind::EnvironmentFlake,
            HarnessError::SetupFailed(_)
            | HarnessError::AmbiguousProcess { .. }
            | HarnessError::KillFailed { .. }
            | HarnessError::MallocDebugAlreadyActive { .. }
            | HarnessError::IoError { .. }
            | HarnessError::DownloadFailed(_)
            | HarnessError::ConfigError(_)
            | HarnessError::Other(_) => ErrorKind::SetupFailure,
        }
    }

    /// Environment flakes are skips; everything else fails the run.
    pub fn verdict(&self) -> Verdict {
        match self.kind() {
            ErrorKind::EnvironmentFlake => Verdict::Skip,
            ErrorKind::SetupFailure | ErrorKind::AssertionViolation => Verdict::Fail,
        }
    }

    pub fn is_assertion(&self) -> bool {
        self.kind() == ErrorKind::AssertionViolation
    }

    pub fn is_skip(&self) -> bool {
        self.verdict() == Verdict::Skip
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            HarnessError::MallocDebugAlreadyActive { .. } => format!(
                "{self}. Another malloc debug session is active; clear the property or wait for it to finish."
            ),
            HarnessError::KillFailed {
                reason: KillFailure::InsufficientPermissions,
                ..
            } => format!("{self}. Enable root on the device first."),
            HarnessError::Skipped(reason) => format!("SKIPPED: {reason}"),
            _ => self.to_string(),
        }
    }

    pub fn from_io_error(path: impl Into<String>, error: io::Error) -> Self {
        HarnessError::IoError {
            path: path.into(),
            source: error,
        }
    }

    /// Build an assertion error that carries the full command output for triage.
    pub fn rejected(message: impl Into<String>, outcome: &CommandOutcome) -> Self {
        HarnessError::OutcomeRejected {
            message: message.into(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
        }
    }
}

/// Keep the first error of a sequence of fallible steps, logging the rest.
pub(crate) fn first_error(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(err) = result {
            if first.is_none() {
                first = Some(err);
            } else {
                tracing::warn!("suppressed secondary failure: {err}");
            }
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CommandStatus;

    #[test]
    fn test_error_display() {
        let err = HarnessError::ExpectedProcessNotFound("mediaserver".to_string());
        assert_eq!(
            err.to_string(),
            "Expected to kill processes matching 'mediaserver' but none were found"
        );
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            HarnessError::Skipped("timeout".into()).kind(),
            ErrorKind::EnvironmentFlake
        );
        assert_eq!(
            HarnessError::AssertionFailed("crash".into()).kind(),
            ErrorKind::AssertionViolation
        );
        assert_eq!(
            HarnessError::SetupFailed("push".into()).kind(),
            ErrorKind::SetupFailure
        );
    }

    #[test]
    fn test_verdict() {
        assert_eq!(HarnessError::Skipped("x".into()).verdict(), Verdict::Skip);
        assert_eq!(
            HarnessError::AssertionFailed("x".into()).verdict(),
            Verdict::Fail
        );
        assert!(HarnessError::WaitTimeout {
            what: "x".into(),
            timeout_ms: 10
        }
        .is_skip());
    }

    #[test]
    fn test_rejected_carries_output() {
        let outcome = CommandOutcome {
            exit_code: Some(113),
            stdout: "out".into(),
            stderr: "err".into(),
            status: CommandStatus::Failed,
        };
        let err = HarnessError::rejected("vulnerable", &outcome);
        let text = err.to_string();
        assert!(text.contains("vulnerable"));
        assert!(text.contains("113"));
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(err.is_assertion());
    }

    #[test]
    fn test_first_error_keeps_first() {
        let result = first_error(vec![
            Ok(()),
            Err(HarnessError::SetupFailed("first".into())),
            Err(HarnessError::SetupFailed("second".into())),
        ]);
        assert!(result.unwrap_err().to_string().contains("first"));
    }

    #[test]
    fn test_user_message() {
        let err = HarnessError::KillFailed {
            pid: 1,
            reason: KillFailure::InsufficientPermissions,
        };
        assert!(err.user_message().contains("root"));
    }
}
