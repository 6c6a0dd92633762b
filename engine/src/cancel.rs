//! Cooperative cancellation.
//!
//! A `CancellationToken` is cloned into everything that has a checkpoint.
//! The process installs a termination handler that calls [`CancellationToken::cancel`];
//! the engine and the retry loop poll the token between operations. In-flight
//! I/O is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Terminated;

/// Slice length used while sleeping, so a cancellation is seen promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from a signal handler thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint: `Err(Terminated)` once cancellation was requested.
    pub fn check(&self) -> Result<(), Terminated> {
        if self.is_cancelled() {
            Err(Terminated)
        } else {
            Ok(())
        }
    }

    /// Block for `duration`, returning early with `Err(Terminated)` if
    /// cancellation is requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), Terminated> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
