//! Ctrl-C handling for commands that hold a device session open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};

use crate::error::{HarnessError, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the interrupt flag.
pub fn install_interrupt_handler() -> Result<()> {
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            signal::signal(sig, SigHandler::Handler(handle_interrupt)).map_err(|errno| {
                HarnessError::ConfigError(format!("cannot install {sig} handler: {errno}"))
            })?;
        }
    }
    Ok(())
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Block until interrupted or until `limit` elapses. Returns whether an
/// interrupt arrived.
pub fn wait_for_interrupt(limit: Option<Duration>, poll: Duration) -> bool {
    let deadline = limit.map(|limit| Instant::now() + limit);
    loop {
        if is_interrupted() {
            return true;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        thread::sleep(poll);
    }
}
