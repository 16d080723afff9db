//! The process-wide cancellation flag and the signal handler that sets it.
//!
//! Per design, there is exactly one piece of global state in this crate: a
//! `stopped` flag, owned by the outer run loop and polled by the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) between claims and by
//! each worker between lines (spec §5 "Cancellation").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod signals;

#[cfg(unix)]
use signals::unix::Signals;
#[cfg(windows)]
use signals::windows::Signals;

/// Indicates an error registering a signal handler.
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

/// A process-wide, cheaply cloneable cancellation flag.
///
/// `Stopped` is the only global datum this crate introduces. Every other
/// piece of state (lease managers, trackers) is instance-scoped.
#[derive(Clone, Debug, Default)]
pub struct Stopped(Arc<AtomicBool>);

impl Stopped {
    /// Creates a new, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Returns true if the flag has been set.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the flag. Idempotent.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Spawns a task that sets the flag on `SIGINT`/`SIGTERM` (or
    /// `Ctrl-C`/`Ctrl-Break` on Windows) and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError`] if the signal handler cannot be registered.
    pub fn watch_signals(&self) -> Result<tokio::task::JoinHandle<()>, RegisterError> {
        let mut signals = Signals::new()?;
        let stopped = self.clone();
        Ok(tokio::spawn(async move {
            signals.recv().await;
            tracing::info!("signal received, stopping");
            stopped.stop();
        }))
    }
}

#[cfg(test)]
mod test {
    use super::Stopped;

    #[test]
    fn starts_unset() {
        assert!(!Stopped::new().is_stopped());
    }

    #[test]
    fn stop_is_observed_through_clones() {
        let a = Stopped::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
    }
}
