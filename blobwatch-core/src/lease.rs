//! A renewable mutual-exclusion token on a single blob.
//!
//! The lease is the only cluster-wide exclusion primitive available to the
//! trackers that need one (the tag and container-move variants); because it
//! expires, renewal is mandatory during long-running work. Renewal failure is
//! surfaced rather than swallowed: another replica may already have
//! re-acquired the lease and started processing, so the current worker must
//! treat its in-flight work as invalid (spec §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::object_store::{ErrorKind, LeaseToken, ObjectStore, StoreError};

/// Errors from the lease manager's own operations. Store errors that aren't
/// a recognized conflict/already-gone kind pass through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying store rejected the request for a reason other than
    /// lease conflict or "already gone" (both of which are handled inline).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `renew` or `release` was called before a lease was ever acquired.
    #[error("no lease is currently held")]
    NotHeld,
}

struct RenewalHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Manages a single blob's lease: acquire, renew on a timer, release, and
/// notify an owner-supplied callback the first time renewal fails.
///
/// Cheap to clone: internals are `Arc`-shared, which is what lets
/// [`start_renewal`](Self::start_renewal) hand a clone to its background
/// task without creating an ownership cycle back to the tracker that holds
/// this manager.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ObjectStore>,
    container: Arc<str>,
    name: Arc<str>,
    duration: Duration,
    token: Arc<Mutex<Option<LeaseToken>>>,
    renewal: Arc<Mutex<Option<RenewalHandle>>>,
    renewing: Arc<AtomicBool>,
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl LeaseManager {
    /// Creates a lease manager for `name` in `container`. `duration` is the
    /// lease's requested lifetime (15-60s per spec §4.1); it is not
    /// validated here — see [`crate::config::Config::validate`].
    pub fn new(store: Arc<dyn ObjectStore>, container: impl Into<String>, name: impl Into<String>, duration: Duration) -> Self {
        Self {
            store,
            container: Arc::from(container.into()),
            name: Arc::from(name.into()),
            duration,
            token: Arc::new(Mutex::new(None)),
            renewal: Arc::new(Mutex::new(None)),
            renewing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The blob this manager leases.
    #[must_use]
    pub fn blob_name(&self) -> &str {
        &self.name
    }

    /// Returns the current lease token, if one is held.
    #[must_use]
    pub fn token(&self) -> Option<LeaseToken> {
        self.token.lock().expect("lease token mutex poisoned").clone()
    }

    /// Attempts to acquire the lease. Returns `None` (not an error) if
    /// another holder already has it.
    pub async fn acquire(&self) -> Result<Option<LeaseToken>, Error> {
        match self
            .store
            .acquire_lease(&self.container, &self.name, self.duration)
            .await
        {
            Ok(token) => {
                *self.token.lock().expect("lease token mutex poisoned") = Some(token.clone());
                Ok(Some(token))
            }
            Err(e) if e.is_lease_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Extends the currently held lease.
    pub async fn renew(&self) -> Result<(), Error> {
        let token = self.token().ok_or(Error::NotHeld)?;
        self.store
            .renew_lease(&self.container, &self.name, &token)
            .await?;
        Ok(())
    }

    /// Releases the lease. A "not held" reply from the store is swallowed as
    /// success, matching spec §4.1. Also stops any active renewal timer.
    pub async fn release(&self) -> Result<(), Error> {
        self.stop_renewal();

        let token = self.token.lock().expect("lease token mutex poisoned").take();
        let Some(token) = token else {
            return Ok(());
        };

        match self
            .store
            .release_lease(&self.container, &self.name, &token)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::LeaseAlreadyGone => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Schedules `renew` at a fixed period on a dedicated task. On the first
    /// renewal failure, `on_failure` is invoked exactly once and the timer
    /// stops; no further renewals are attempted.
    ///
    /// `on_failure` runs on the timer task and must be side-effect-only (set
    /// a flag) — the recommended use is handing it a clone of the tracker's
    /// compromised-leases set handle, never the tracker itself, to avoid an
    /// ownership cycle between the lease manager and its owner.
    pub fn start_renewal(&self, period: Duration, on_failure: impl Fn() + Send + Sync + 'static) {
        self.stop_renewal();

        if self.renewing.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = CancellationToken::new();
        let task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(period) => {}
                    }

                    if let Err(error) = this.renew().await {
                        tracing::warn!(blob = %this.name, %error, "lease renewal failed");
                        on_failure();
                        break;
                    }
                }
                this.renewing.store(false, Ordering::SeqCst);
            })
        };

        *self.renewal.lock().expect("renewal mutex poisoned") = Some(RenewalHandle { cancel, task });
    }

    /// Cancels the renewal timer. Idempotent.
    pub fn stop_renewal(&self) {
        if let Some(handle) = self.renewal.lock().expect("renewal mutex poisoned").take() {
            handle.cancel.cancel();
            handle.task.abort();
            self.renewing.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::FakeStore;
    use std::sync::atomic::AtomicUsize;

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(FakeStore::new())
    }

    #[tokio::test]
    async fn acquire_then_conflict_then_release_frees_it() {
        let store = store();
        let a = LeaseManager::new(store.clone(), "c", "blob", Duration::from_secs(30));
        let b = LeaseManager::new(store, "c", "blob", Duration::from_secs(30));

        assert!(a.acquire().await.unwrap().is_some());
        assert!(b.acquire().await.unwrap().is_none(), "conflict expected");

        a.release().await.unwrap();
        assert!(b.acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_failure_invokes_callback_once_and_stops() {
        let store = Arc::new(FakeStore::new());
        let mgr = LeaseManager::new(store.clone(), "c", "blob", Duration::from_millis(100));
        mgr.acquire().await.unwrap().expect("acquired");

        let calls = Arc::new(AtomicUsize::new(0));
        // Another holder steals the lease out from under the renewal timer by
        // forcing the next renew() to fail, simulating an expired/stolen lease.
        store.fail_next_renew("blob");

        let calls2 = calls.clone();
        mgr.start_renewal(Duration::from_millis(10), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // No further renewals fire even if we wait more.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_without_acquire_is_a_noop() {
        let mgr = LeaseManager::new(store(), "c", "blob", Duration::from_secs(30));
        mgr.release().await.unwrap();
    }

    #[tokio::test]
    async fn stop_renewal_is_idempotent() {
        let mgr = LeaseManager::new(store(), "c", "blob", Duration::from_secs(30));
        mgr.stop_renewal();
        mgr.stop_renewal();
    }
}
