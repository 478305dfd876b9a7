//! Shutdown signalling shared by every task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a task blocks on a channel before re-checking the shutdown
/// token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Requests a task can raise to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Finish current work and exit gracefully.
    StopExecution,
    /// The sending task cannot continue; the whole process should shut
    /// down.
    ThreadCannotContinue,
}

/// Cooperative shutdown flag.
///
/// Cloning is cheap and shares state; every task polls the token from its
/// receive loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_shared_across_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_shutdown());
        token.shutdown();
        assert!(clone.is_shutdown());
    }
}
