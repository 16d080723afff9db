//! The polymorphic state tracker (spec §4.3): three interchangeable claim
//! and completion-bookkeeping strategies sharing one six-method contract.
//!
//! Per the design notes (spec §9), this is tagged-variant dispatch rather
//! than a trait object: three concrete implementations, one `Tracker` enum
//! that matches on itself. None of the variant-specific types leak through
//! the shared contract.

mod container_move;
#[cfg(feature = "registry")]
mod registry;
mod tags;

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};

use crate::lease::LeaseManager;
use crate::object_store::{BlobInfo, ObjectStore};

pub use container_move::ContainerMoveTracker;
#[cfg(feature = "registry")]
pub use registry::RegistryTracker;
pub use tags::TagTracker;

/// Errors from tracker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying object store rejected a request.
    #[error(transparent)]
    Store(#[from] crate::object_store::StoreError),

    /// A lease operation failed.
    #[error(transparent)]
    Lease(#[from] crate::lease::Error),

    /// The local registry rejected a request.
    #[cfg(feature = "registry")]
    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    /// `mark_completed`/`mark_failed` was asked to delete a blob on the
    /// container-move path with no lease held — a programming error (spec
    /// §4.3.B: "refuse to delete if no lease is held").
    #[error("no lease held for {0:?}")]
    NoLeaseHeld(String),
}

impl Error {
    fn no_lease_held(name: &str) -> Self {
        Error::NoLeaseHeld(name.to_string())
    }
}

/// Shared bookkeeping for the two multi-replica trackers (tags,
/// container-move): the active-lease map and the compromised-leases set
/// (spec §3 "Active-lease map").
///
/// `compromised` is handed to each lease manager's renewal task as a cloned
/// `Arc`, not `self`, breaking the ownership cycle the design notes call out
/// (spec §9).
struct LeaseBook {
    leases: DashMap<String, LeaseManager>,
    compromised: Arc<DashSet<String>>,
}

impl LeaseBook {
    fn new() -> Self {
        Self {
            leases: DashMap::new(),
            compromised: Arc::new(DashSet::new()),
        }
    }

    /// Registers an already-acquired lease manager and starts its renewal
    /// timer, wiring its failure callback to this book's compromised set.
    fn adopt(&self, name: &str, mgr: LeaseManager, renewal: Duration) {
        let compromised = self.compromised.clone();
        let owned_name = name.to_string();
        mgr.start_renewal(renewal, move || {
            compromised.insert(owned_name.clone());
        });
        self.leases.insert(name.to_string(), mgr);
    }

    /// Removes `name` from the map without releasing its lease — used after
    /// a terminal mark that deletes the blob (and thus implicitly releases
    /// the lease) on the container-move path.
    fn forget(&self, name: &str) {
        self.leases.remove(name);
    }

    /// Relinquishes the lease for `name`, if one is held. A no-op with a
    /// diagnostic when nothing is held, which is the expected case when a
    /// terminal mark already removed the entry (spec §9 open question).
    async fn release(&self, name: &str) -> Result<(), Error> {
        match self.leases.remove(name) {
            Some((_, mgr)) => Ok(mgr.release().await?),
            None => {
                tracing::debug!(blob = name, "release called with no active lease; already terminal");
                Ok(())
            }
        }
    }

    fn token(&self, name: &str) -> Option<String> {
        self.leases.get(name).and_then(|m| m.token())
    }

    /// Reads and clears the compromised flag for `name`.
    fn was_compromised(&self, name: &str) -> bool {
        self.compromised.remove(name).is_some()
    }

    /// Releases every still-held lease, swallowing per-lease errors (spec §7
    /// "`close()` on the tracker swallows per-lease errors and continues").
    async fn close(&self) {
        let names: Vec<String> = self.leases.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(error) = self.release(&name).await {
                tracing::warn!(blob = %name, %error, "failed to release lease during close");
            }
        }
    }
}

/// The shared six-method contract, dispatched by variant (spec §9).
pub enum Tracker {
    /// Index-tags variant (spec §4.3.A).
    Tags(TagTracker),
    /// Container-move variant (spec §4.3.B).
    Container(ContainerMoveTracker),
    /// Local-registry variant (spec §4.3.C).
    #[cfg(feature = "registry")]
    Registry(RegistryTracker),
}

impl Tracker {
    /// Builds the index-tags variant.
    pub fn tags(store: Arc<dyn ObjectStore>, container: impl Into<String>, processor: impl Into<String>, lease_duration: Duration, lease_renewal: Duration) -> Self {
        Tracker::Tags(TagTracker::new(store, container, processor, lease_duration, lease_renewal))
    }

    /// Builds the container-move variant.
    pub fn container_move(
        store: Arc<dyn ObjectStore>,
        containers: crate::config::ContainerNames,
        lease_duration: Duration,
        lease_renewal: Duration,
    ) -> Self {
        Tracker::Container(ContainerMoveTracker::new(store, containers, lease_duration, lease_renewal))
    }

    /// Builds the local-registry variant, opening (or creating) the database
    /// at `path`.
    #[cfg(feature = "registry")]
    pub fn registry(path: &str, processor: impl Into<String>) -> Result<Self, Error> {
        Ok(Tracker::Registry(RegistryTracker::open(path, processor)?))
    }

    /// Returns the subset of `blobs` eligible for processing this cycle;
    /// must include previously-failed blobs (spec §4.3 common contract).
    pub async fn filter_candidates(&self, blobs: Vec<BlobInfo>) -> Result<Vec<BlobInfo>, Error> {
        match self {
            Tracker::Tags(t) => t.filter_candidates(blobs).await,
            Tracker::Container(t) => t.filter_candidates(blobs).await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.filter_candidates(blobs).await,
        }
    }

    /// Attempts exclusive ownership of `name`. `false` means another worker
    /// has it; other failures propagate.
    pub async fn claim(&self, name: &str) -> Result<bool, Error> {
        match self {
            Tracker::Tags(t) => t.claim(name).await,
            Tracker::Container(t) => t.claim(name).await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.claim(name).await,
        }
    }

    /// Terminal success update on a held claim.
    pub async fn mark_completed(&self, name: &str) -> Result<(), Error> {
        match self {
            Tracker::Tags(t) => t.mark_completed(name).await,
            Tracker::Container(t) => t.mark_completed(name).await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.mark_completed(name).await,
        }
    }

    /// Terminal failure update on a held claim.
    pub async fn mark_failed(&self, name: &str, reason: &str) -> Result<(), Error> {
        match self {
            Tracker::Tags(t) => t.mark_failed(name, reason).await,
            Tracker::Container(t) => t.mark_failed(name, reason).await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.mark_failed(name, reason).await,
        }
    }

    /// Relinquishes a claim without changing terminal state.
    pub async fn release(&self, name: &str) -> Result<(), Error> {
        match self {
            Tracker::Tags(t) => t.release(name).await,
            Tracker::Container(t) => t.release(name).await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.release(name).await,
        }
    }

    /// Reads and clears the "renewal failed while this claim was held" flag.
    pub fn was_lease_renewal_compromised(&self, name: &str) -> bool {
        match self {
            Tracker::Tags(t) => t.was_lease_renewal_compromised(name),
            Tracker::Container(t) => t.was_lease_renewal_compromised(name),
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.was_lease_renewal_compromised(name),
        }
    }

    /// Releases every still-held claim.
    pub async fn close(&self) {
        match self {
            Tracker::Tags(t) => t.close().await,
            Tracker::Container(t) => t.close().await,
            #[cfg(feature = "registry")]
            Tracker::Registry(t) => t.close().await,
        }
    }
}
