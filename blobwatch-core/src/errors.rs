//! The crate-level error union.
//!
//! Each subsystem defines its own `thiserror` enum at its own boundary
//! ([`crate::lease::Error`], [`crate::streamer::Error`],
//! [`crate::tracker::Error`], [`crate::orchestrator::Error`]); this type
//! exists for callers who just want one channel to propagate, composed the
//! way the teacher crate composes `BuildError`/`RunError` out of its
//! per-module error types.

/// The union of every subsystem's error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lease manager operation failed.
    #[error(transparent)]
    Lease(#[from] crate::lease::Error),

    /// The line streamer failed.
    #[error(transparent)]
    Streamer(#[from] crate::streamer::Error),

    /// A state tracker operation failed.
    #[error(transparent)]
    Tracker(#[from] crate::tracker::Error),

    /// The poll orchestrator failed outside of a per-blob task (listing or
    /// filtering) — spec §7 propagation policy.
    #[error(transparent)]
    Orchestrator(#[from] crate::orchestrator::Error),

    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
