//! Container-move state tracker (spec §4.3.B): state is implicit in which of
//! three containers (incoming, archive, errors) a blob currently lives in.
//! Needs copy+delete permission but no tag-write permission.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ContainerNames;
use crate::lease::LeaseManager;
use crate::object_store::{BlobInfo, ObjectStore};

use super::{Error, LeaseBook};

/// The container-move tracker.
pub struct ContainerMoveTracker {
    store: Arc<dyn ObjectStore>,
    containers: ContainerNames,
    lease_duration: Duration,
    lease_renewal: Duration,
    book: LeaseBook,
}

impl ContainerMoveTracker {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, containers: ContainerNames, lease_duration: Duration, lease_renewal: Duration) -> Self {
        Self {
            store,
            containers,
            lease_duration,
            lease_renewal,
            book: LeaseBook::new(),
        }
    }

    pub(crate) async fn filter_candidates(&self, blobs: Vec<BlobInfo>) -> Result<Vec<BlobInfo>, Error> {
        let mut out = Vec::with_capacity(blobs.len());
        for info in blobs {
            // A single per-blob existence probe, not a full archive listing
            // (spec §4.3.B explicitly rejects the listing approach: it
            // scales linearly in archive size).
            if !self.store.exists(&self.containers.archive, &info.name).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    pub(crate) async fn claim(&self, name: &str) -> Result<bool, Error> {
        let mgr = LeaseManager::new(self.store.clone(), self.containers.incoming.clone(), name, self.lease_duration);
        let Some(_token) = mgr.acquire().await? else {
            return Ok(false);
        };
        self.book.adopt(name, mgr, self.lease_renewal);
        Ok(true)
    }

    /// Copies `incoming/name` to `destination/name`, waits for completion,
    /// then deletes `incoming/name` under the held lease token. Copy must
    /// precede delete: if copy fails, the blob stays in incoming for retry;
    /// if delete fails after copy succeeds, the next cycle's existence probe
    /// against the destination will exclude it (spec §4.3.B).
    async fn move_to(&self, name: &str, destination: &str) -> Result<(), Error> {
        let token = self.book.token(name).ok_or_else(|| Error::no_lease_held(name))?;

        self.store.copy_blob(&self.containers.incoming, destination, name).await?;
        self.store
            .delete_blob(&self.containers.incoming, name, Some(&token))
            .await?;

        // Deleting the blob implicitly releases its lease; an explicit
        // release would error against a vanished blob, so the entry is
        // simply forgotten (spec §4.3.B, §9 open question).
        self.book.forget(name);
        Ok(())
    }

    pub(crate) async fn mark_completed(&self, name: &str) -> Result<(), Error> {
        let archive = self.containers.archive.clone();
        self.move_to(name, &archive).await
    }

    pub(crate) async fn mark_failed(&self, name: &str, reason: &str) -> Result<(), Error> {
        tracing::info!(blob = name, reason, "moving blob to errors container");
        let errors = self.containers.errors.clone();
        self.move_to(name, &errors).await
    }

    pub(crate) async fn release(&self, name: &str) -> Result<(), Error> {
        self.book.release(name).await
    }

    pub(crate) fn was_lease_renewal_compromised(&self, name: &str) -> bool {
        self.book.was_compromised(name)
    }

    pub(crate) async fn close(&self) {
        self.book.close().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::FakeStore;
    use chrono::Utc;

    fn containers() -> ContainerNames {
        ContainerNames {
            incoming: "incoming".into(),
            archive: "archive".into(),
            errors: "errors".into(),
        }
    }

    fn tracker(store: Arc<FakeStore>) -> ContainerMoveTracker {
        ContainerMoveTracker::new(store, containers(), Duration::from_secs(30), Duration::from_secs(20))
    }

    #[tokio::test]
    async fn mark_completed_moves_blob_to_archive() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "line1\n");
        let t = tracker(store.clone());

        assert!(t.claim("x.log").await.unwrap());
        t.mark_completed("x.log").await.unwrap();

        assert!(!store.contains_for_test("incoming", "x.log"));
        assert!(store.contains_for_test("archive", "x.log"));
        // No explicit release call needed; deletion already forgot the lease.
        t.release("x.log").await.unwrap();
    }

    #[tokio::test]
    async fn mark_failed_moves_blob_to_errors() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "line1\n");
        let t = tracker(store.clone());

        assert!(t.claim("x.log").await.unwrap());
        t.mark_failed("x.log", "boom").await.unwrap();

        assert!(!store.contains_for_test("incoming", "x.log"));
        assert!(store.contains_for_test("errors", "x.log"));
    }

    #[tokio::test]
    async fn s5_blob_present_in_both_incoming_and_archive_is_excluded() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "line1\n");
        store.put_blob("archive", "x.log", "line1\n");
        let t = tracker(store.clone());

        let listed = vec![BlobInfo {
            name: "x.log".into(),
            size: None,
            last_modified: Utc::now(),
            tags: None,
        }];
        let candidates = t.filter_candidates(listed).await.unwrap();
        assert!(candidates.is_empty());
        assert!(store.contains_for_test("incoming", "x.log"));
    }

    #[tokio::test]
    async fn mark_completed_without_a_claim_is_refused() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "line1\n");
        let t = tracker(store);

        let err = t.mark_completed("x.log").await.unwrap_err();
        assert!(matches!(err, Error::NoLeaseHeld(ref n) if n == "x.log"));
    }

    #[tokio::test]
    async fn release_without_terminal_mark_frees_the_lease() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "line1\n");
        let t1 = tracker(store.clone());
        let t2 = tracker(store);

        assert!(t1.claim("x.log").await.unwrap());
        assert!(!t2.claim("x.log").await.unwrap());

        t1.release("x.log").await.unwrap();
        assert!(t2.claim("x.log").await.unwrap());
    }
}
