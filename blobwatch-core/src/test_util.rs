//! An in-memory [`ObjectStore`] fake, used by this crate's own tests and
//! available to downstream crates (behind the `test-util` feature) that want
//! to exercise the orchestrator and trackers without a live Azure account.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::object_store::{
    BlobInfo, BlobReader, ErrorKind, LeaseToken, ListPage, ObjectStore, StoreError,
};

#[derive(Clone)]
struct Blob {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
    tags: HashMap<String, String>,
    lease_token: Option<String>,
    lease_expiry: Option<DateTime<Utc>>,
    lease_duration: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<(String, String), Blob>,
    fail_next_renew: HashSet<String>,
    next_token: u64,
}

/// A deterministic, synchronous, in-memory stand-in for a real object-store
/// client. Not a mock framework: state is plain data, inspectable from test
/// code via the `*_for_test` helpers below.
pub struct FakeStore {
    inner: Mutex<Inner>,
    token_counter: AtomicU64,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            token_counter: AtomicU64::new(0),
        }
    }

    /// Inserts or overwrites a blob's bytes, bumping its last-modified time.
    pub fn put_blob(&self, container: &str, name: &str, bytes: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().blobs.insert(
            (container.to_string(), name.to_string()),
            Blob {
                bytes: bytes.into(),
                last_modified: Utc::now(),
                tags: HashMap::new(),
                lease_token: None,
                lease_expiry: None,
                lease_duration: None,
            },
        );
    }

    /// Seeds a blob's initial user-defined tags (distinct from the five
    /// reserved tags the tag tracker writes).
    pub fn put_tags(&self, container: &str, name: &str, tags: HashMap<String, String>) {
        if let Some(blob) = self
            .inner
            .lock()
            .unwrap()
            .blobs
            .get_mut(&(container.to_string(), name.to_string()))
        {
            blob.tags = tags;
        }
    }

    /// Causes the next `renew_lease` call against `name` to fail, simulating
    /// a lease stolen out from under the renewal timer.
    pub fn fail_next_renew(&self, name: &str) {
        self.inner.lock().unwrap().fail_next_renew.insert(name.to_string());
    }

    /// Snapshot of a blob's current tags, for assertions.
    #[must_use]
    pub fn tags_for_test(&self, container: &str, name: &str) -> Option<HashMap<String, String>> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(&(container.to_string(), name.to_string()))
            .map(|b| b.tags.clone())
    }

    /// Whether a blob is currently present in `container`.
    #[must_use]
    pub fn contains_for_test(&self, container: &str, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .contains_key(&(container.to_string(), name.to_string()))
    }

    fn next_token(&self) -> String {
        format!("lease-{}", self.token_counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
        page_size: usize,
    ) -> Result<ListPage, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<&String> = inner
            .blobs
            .keys()
            .filter(|(c, n)| c == container && prefix.map_or(true, |p| n.starts_with(p)))
            .map(|(_, n)| n)
            .collect();
        names.sort();

        let start: usize = continuation.as_deref().map_or(Ok(0), str::parse).unwrap_or(0);
        let end = (start + page_size).min(names.len());
        let blobs = names[start..end]
            .iter()
            .map(|n| {
                let blob = &inner.blobs[&(container.to_string(), (*n).clone())];
                BlobInfo {
                    name: (*n).clone(),
                    size: Some(blob.bytes.len() as u64),
                    last_modified: blob.last_modified,
                    tags: Some(blob.tags.clone()),
                }
            })
            .collect();

        let continuation = if end < names.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(ListPage { blobs, continuation })
    }

    async fn open_read_stream(&self, container: &str, name: &str) -> Result<BlobReader, StoreError> {
        let inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get(&(container.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))?;
        Ok(Box::new(Cursor::new(blob.bytes.clone())))
    }

    async fn last_modified(&self, container: &str, name: &str) -> Result<DateTime<Utc>, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(&(container.to_string(), name.to_string()))
            .map(|b| b.last_modified)
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))
    }

    async fn get_tags(&self, container: &str, name: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(&(container.to_string(), name.to_string()))
            .map(|b| b.tags.clone())
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))
    }

    async fn set_tags(
        &self,
        container: &str,
        name: &str,
        tags: &HashMap<String, String>,
        condition: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get_mut(&(container.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))?;
        if let Some(condition) = condition {
            if blob.lease_token.as_deref() != Some(condition) {
                return Err(StoreError::new(ErrorKind::PreconditionFailed, "lease token mismatch"));
            }
        }
        blob.tags = tags.clone();
        Ok(())
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blobs
            .contains_key(&(container.to_string(), name.to_string())))
    }

    async fn copy_blob(&self, src_container: &str, dst_container: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner
            .blobs
            .get(&(src_container.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))?;
        inner
            .blobs
            .insert((dst_container.to_string(), name.to_string()), src);
        Ok(())
    }

    async fn delete_blob(&self, container: &str, name: &str, condition: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (container.to_string(), name.to_string());
        let Some(blob) = inner.blobs.get(&key) else {
            return Err(StoreError::new(ErrorKind::NotFound, "no such blob"));
        };
        if let Some(condition) = condition {
            if blob.lease_token.as_deref() != Some(condition) {
                return Err(StoreError::new(ErrorKind::PreconditionFailed, "lease token mismatch"));
            }
        }
        inner.blobs.remove(&key);
        Ok(())
    }

    async fn acquire_lease(&self, container: &str, name: &str, duration: Duration) -> Result<LeaseToken, StoreError> {
        let token = self.next_token();
        let mut inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get_mut(&(container.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))?;

        let now = Utc::now();
        if let Some(expiry) = blob.lease_expiry {
            if expiry > now {
                return Err(StoreError::new(ErrorKind::LeaseConflict, "already leased"));
            }
        }

        blob.lease_token = Some(token.clone());
        blob.lease_expiry = Some(now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()));
        blob.lease_duration = Some(duration);
        Ok(token)
    }

    async fn renew_lease(&self, container: &str, name: &str, token: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_renew.remove(name) {
            return Err(StoreError::new(ErrorKind::Other, "simulated renewal failure"));
        }
        let blob = inner
            .blobs
            .get_mut(&(container.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "no such blob"))?;
        if blob.lease_token.as_deref() != Some(token) {
            return Err(StoreError::new(ErrorKind::PreconditionFailed, "lease token mismatch"));
        }
        let duration = blob.lease_duration.unwrap_or(Duration::from_secs(30));
        blob.lease_expiry =
            Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()));
        Ok(())
    }

    async fn release_lease(&self, container: &str, name: &str, token: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(blob) = inner.blobs.get_mut(&(container.to_string(), name.to_string())) else {
            // Deleting a blob implicitly releases its lease (spec §4.3.B);
            // a follow-up release against a vanished blob is "not held".
            return Err(StoreError::new(ErrorKind::LeaseAlreadyGone, "blob no longer exists"));
        };
        if blob.lease_token.as_deref() != Some(token) {
            return Err(StoreError::new(ErrorKind::LeaseAlreadyGone, "lease not held"));
        }
        blob.lease_token = None;
        blob.lease_expiry = None;
        blob.lease_duration = None;
        Ok(())
    }
}
