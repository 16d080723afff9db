//! Core subsystems for tailing an object-storage container of log blobs.
//!
//! Four tightly coupled pieces live here:
//!
//! - [`object_store`] — the abstract port this crate consumes; bring your own
//!   client SDK by implementing [`object_store::ObjectStore`].
//! - [`lease`] — a renewable mutual-exclusion token on a single blob.
//! - [`streamer`] — memory-bounded line extraction with provenance metadata.
//! - [`tracker`] — the three interchangeable claim/completion bookkeeping
//!   strategies (tags, container-move, local registry).
//! - [`orchestrator`] — wires the above into one poll cycle: list, filter,
//!   claim, process, release.
//!
//! [`config`], [`log`] and [`shutdown`] are the ambient wiring a deployed
//! binary needs around the core: configuration parsing/validation, a global
//! tracing subscriber, and a process-wide cancellation flag.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod lease;
pub mod log;
pub mod object_store;
pub mod orchestrator;
pub mod shutdown;
pub mod streamer;
pub mod tracker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use config::Config;
pub use errors::Error;
pub use object_store::ObjectStore;
pub use orchestrator::{CycleSummary, Orchestrator};
pub use shutdown::Stopped;
pub use tracker::Tracker;
