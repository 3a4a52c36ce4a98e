pub mod asserter;
pub mod cli;
pub mod config;
pub mod crash;
pub mod device;
pub mod error;
pub mod frida;
pub mod malloc_debug;
pub mod poc;
pub mod process;
pub mod rootcanal;
pub mod scope;
pub mod signals;
pub mod workflow;

pub use asserter::{
    AssertScope, Asserter, CompositeAsserter, CrashAsserter, ExitCodeAsserter,
    MallocDebugAsserter, NoopAsserter,
};
pub use config::HarnessConfig;
pub use device::{AdbDevice, CommandOutcome, CommandStatus, Device};
pub use error::{ErrorKind, HarnessError, Result, Verdict};
pub use frida::{DynamicInstrumentationSession, GithubReleaseFetcher, ReleaseFetcher};
pub use malloc_debug::{MallocDebugConfig, MallocDebugSession};
pub use poc::{Bitness, NativePocRunner, PocSpec, RunReport};
pub use process::{KillFailure, KillOutcome, ProcessHandle, ProcessRegistry};
pub use rootcanal::RootcanalSession;
pub use scope::UploadedArtifact;
