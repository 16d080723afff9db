//! The abstract object-storage port this crate consumes.
//!
//! Credential/endpoint resolution and the concrete client SDK are out of
//! scope for this crate (see the crate-level docs); callers bring their own
//! [`ObjectStore`] implementation. A fake implementation suitable for tests
//! lives in [`crate::test_util`] behind the `test-util` feature.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

/// Attributes of a blob as reported by a listing or a tag read, prior to any
/// byte access.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobInfo {
    /// UTF-8 path-like name, unique within its container.
    pub name: String,
    /// Size in bytes, when the store reports it.
    pub size: Option<u64>,
    /// Last-modified instant.
    pub last_modified: DateTime<Utc>,
    /// Index tags prefetched on the listing response, if the store exposes
    /// them there. `None` means the caller must issue a separate tag read.
    pub tags: Option<HashMap<String, String>>,
}

/// One page of a [`ObjectStore::list_blobs`] listing.
#[derive(Debug, Default)]
pub struct ListPage {
    /// Blobs in the store's natural (lexicographic) order.
    pub blobs: Vec<BlobInfo>,
    /// Opaque continuation token; `None` means the listing is exhausted.
    pub continuation: Option<String>,
}

/// A write-condition token: the store only applies the write if the blob's
/// current lease matches.
pub type LeaseToken = String;

/// Distinguishable error kinds the orchestrator and trackers branch on. Every
/// other failure is [`ErrorKind::Other`] and is treated as a transient store
/// error (§7: surfaces as a failed blob, not specially recovered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Another holder already has the lease being acquired.
    LeaseConflict,
    /// A conditional write was rejected because the supplied lease token no
    /// longer matches.
    PreconditionFailed,
    /// The blob (or lease) named in the request does not exist.
    NotFound,
    /// A release was attempted against a lease that is already gone; this is
    /// swallowed as success by [`crate::lease::LeaseManager::release`].
    LeaseAlreadyGone,
    /// Timeouts, 5xx, and anything else not specially recovered.
    Other,
}

/// An error surfaced by an [`ObjectStore`] operation.
#[derive(Debug, thiserror::Error)]
#[error("object store error ({kind:?}): {message}")]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
}

impl StoreError {
    /// Builds a new store error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The distinguishable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True iff this is a lease conflict (another holder exists).
    #[must_use]
    pub fn is_lease_conflict(&self) -> bool {
        self.kind == ErrorKind::LeaseConflict
    }

    /// True iff this is a rejected conditional write.
    #[must_use]
    pub fn is_precondition_failed(&self) -> bool {
        self.kind == ErrorKind::PreconditionFailed
    }

    /// True iff release found no lease to release.
    #[must_use]
    pub fn is_lease_already_gone(&self) -> bool {
        self.kind == ErrorKind::LeaseAlreadyGone
    }
}

/// A byte stream handle scoped to one worker task.
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

/// The object-storage capabilities the core consumes, treated as an
/// abstract port (spec §6). Implementations typically wrap a real client SDK
/// such as the Azure Blob Storage SDK.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists one page of blobs in `container`, optionally constrained to
    /// `prefix`, continuing from a prior page's continuation token.
    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
        continuation: Option<String>,
        page_size: usize,
    ) -> Result<ListPage, StoreError>;

    /// Opens a handle to read a blob's bytes from the start.
    async fn open_read_stream(
        &self,
        container: &str,
        name: &str,
    ) -> Result<BlobReader, StoreError>;

    /// Reads a single blob's current last-modified instant, used by the
    /// streamer when it was not already known (e.g. re-read after a claim).
    async fn last_modified(&self, container: &str, name: &str) -> Result<DateTime<Utc>, StoreError>;

    /// Reads a blob's current index tags.
    async fn get_tags(
        &self,
        container: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Writes a blob's complete index-tag set, replacing what was there.
    /// `condition`, when set, must match the blob's current lease token or
    /// the write is rejected with [`ErrorKind::PreconditionFailed`].
    async fn set_tags(
        &self,
        container: &str,
        name: &str,
        tags: &HashMap<String, String>,
        condition: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Probes for the existence of `name` in `container` without listing.
    async fn exists(&self, container: &str, name: &str) -> Result<bool, StoreError>;

    /// Server-side copies `name` from `src_container` to `dst_container`,
    /// awaiting completion before returning.
    async fn copy_blob(
        &self,
        src_container: &str,
        dst_container: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Deletes a blob. `condition`, when set, must match the blob's current
    /// lease token.
    async fn delete_blob(
        &self,
        container: &str,
        name: &str,
        condition: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Acquires a lease of the given duration (15-60s), returning the token.
    /// Rejects with [`ErrorKind::LeaseConflict`] if another holder exists.
    async fn acquire_lease(
        &self,
        container: &str,
        name: &str,
        duration: Duration,
    ) -> Result<LeaseToken, StoreError>;

    /// Extends a held lease.
    async fn renew_lease(
        &self,
        container: &str,
        name: &str,
        token: &str,
    ) -> Result<(), StoreError>;

    /// Releases a held lease. A "not held" reply is the caller's
    /// responsibility to treat as success (spec §4.1); this method reports
    /// the store's literal response, including [`ErrorKind::LeaseAlreadyGone`].
    async fn release_lease(
        &self,
        container: &str,
        name: &str,
        token: &str,
    ) -> Result<(), StoreError>;
}
