//! Index-tags state tracker (spec §4.3.A): state lives in five reserved
//! tags on the blob itself. Needs only tag-write permission, but tolerates
//! multiple replicas because claim commits the reserved tags under the
//! lease token as a write condition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::lease::LeaseManager;
use crate::object_store::{BlobInfo, ObjectStore};

use super::{Error, LeaseBook};

const STATUS: &str = "logstash_status";
const PROCESSOR: &str = "logstash_processor";
const STARTED: &str = "logstash_started";
const COMPLETED: &str = "logstash_completed";
const ERROR: &str = "logstash_error";

/// Characters permitted in a sanitized `logstash_error` value (spec §4.3.A,
/// §6 "Reserved tag keys").
fn is_allowed_error_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || " +-./:=_".contains(c)
}

/// Sanitizes a failure reason for storage in `logstash_error`: disallowed
/// characters become `_`, the result is truncated to 256 characters, and a
/// missing reason becomes the literal `"unknown"`.
pub(crate) fn sanitize_error(reason: &str) -> String {
    if reason.is_empty() {
        return "unknown".to_string();
    }
    let sanitized: String = reason
        .chars()
        .map(|c| if is_allowed_error_char(c) { c } else { '_' })
        .collect();
    sanitized.chars().take(256).collect()
}

/// The index-tags tracker.
pub struct TagTracker {
    store: Arc<dyn ObjectStore>,
    container: String,
    processor: String,
    lease_duration: Duration,
    lease_renewal: Duration,
    book: LeaseBook,
}

impl TagTracker {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        container: impl Into<String>,
        processor: impl Into<String>,
        lease_duration: Duration,
        lease_renewal: Duration,
    ) -> Self {
        Self {
            store,
            container: container.into(),
            processor: processor.into(),
            lease_duration,
            lease_renewal,
            book: LeaseBook::new(),
        }
    }

    async fn tags_for(&self, info: &BlobInfo) -> Result<HashMap<String, String>, Error> {
        match &info.tags {
            Some(tags) => Ok(tags.clone()),
            None => Ok(self.store.get_tags(&self.container, &info.name).await?),
        }
    }

    pub(crate) async fn filter_candidates(&self, blobs: Vec<BlobInfo>) -> Result<Vec<BlobInfo>, Error> {
        let mut out = Vec::with_capacity(blobs.len());
        for info in blobs {
            let tags = self.tags_for(&info).await?;
            let status = tags.get(STATUS).map(String::as_str).unwrap_or("");
            if status.is_empty() || status == "failed" {
                out.push(info);
            }
        }
        Ok(out)
    }

    pub(crate) async fn claim(&self, name: &str) -> Result<bool, Error> {
        let mgr = LeaseManager::new(self.store.clone(), self.container.clone(), name, self.lease_duration);
        let Some(token) = mgr.acquire().await? else {
            return Ok(false);
        };

        let result = self.write_claim_tags(name, &token).await;
        match result {
            Ok(()) => {
                self.book.adopt(name, mgr, self.lease_renewal);
                Ok(true)
            }
            Err(ClaimWriteOutcome::PreconditionFailed) => {
                let _ = mgr.release().await;
                Ok(false)
            }
            Err(ClaimWriteOutcome::Other(e)) => {
                let _ = mgr.release().await;
                Err(e)
            }
        }
    }

    async fn write_claim_tags(&self, name: &str, token: &str) -> Result<(), ClaimWriteOutcome> {
        let existing = self
            .store
            .get_tags(&self.container, name)
            .await
            .map_err(|e| ClaimWriteOutcome::Other(e.into()))?;

        let mut merged = existing;
        merged.insert(STATUS.to_string(), "processing".to_string());
        merged.insert(PROCESSOR.to_string(), self.processor.clone());
        merged.insert(STARTED.to_string(), Utc::now().to_rfc3339());

        match self
            .store
            .set_tags(&self.container, name, &merged, Some(token))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_precondition_failed() => Err(ClaimWriteOutcome::PreconditionFailed),
            Err(e) => Err(ClaimWriteOutcome::Other(e.into())),
        }
    }

    async fn write_terminal_tags(&self, name: &str, status: &str, error: Option<&str>) -> Result<(), Error> {
        let token = self.book.token(name);
        let mut tags = self.store.get_tags(&self.container, name).await?;

        tags.insert(STATUS.to_string(), status.to_string());
        tags.insert(PROCESSOR.to_string(), self.processor.clone());

        match status {
            "completed" => {
                tags.insert(COMPLETED.to_string(), Utc::now().to_rfc3339());
                tags.remove(STARTED);
                tags.remove(ERROR);
            }
            "failed" => {
                tags.insert(ERROR.to_string(), sanitize_error(error.unwrap_or_default()));
            }
            _ => unreachable!("only completed/failed are terminal"),
        }

        self.store
            .set_tags(&self.container, name, &tags, token.as_deref())
            .await?;
        Ok(())
    }

    pub(crate) async fn mark_completed(&self, name: &str) -> Result<(), Error> {
        self.write_terminal_tags(name, "completed", None).await
    }

    pub(crate) async fn mark_failed(&self, name: &str, reason: &str) -> Result<(), Error> {
        self.write_terminal_tags(name, "failed", Some(reason)).await
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

enum ClaimWriteOutcome {
    PreconditionFailed,
    Other(Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::FakeStore;
    use std::collections::HashMap;

    fn tracker(store: Arc<FakeStore>) -> TagTracker {
        TagTracker::new(store, "incoming", "host-1", Duration::from_secs(30), Duration::from_secs(20))
    }

    #[test]
    fn sanitize_replaces_disallowed_chars_and_truncates() {
        assert_eq!(sanitize_error("ok-value_1.2:3=4 5"), "ok-value_1.2:3=4 5");
        assert_eq!(sanitize_error("bad\nvalue\twith\"quotes"), "bad_value_with_quotes");
        assert_eq!(sanitize_error(""), "unknown");
        let long = "x".repeat(400);
        assert_eq!(sanitize_error(&long).len(), 256);
    }

    #[tokio::test]
    async fn s1_three_blobs_complete_then_second_cycle_is_empty() {
        let store = Arc::new(FakeStore::new());
        for name in ["a.log", "b.log", "c.log"] {
            store.put_blob("incoming", name, "line1\nline2\nline3\n");
        }
        let t = tracker(store.clone());

        let listed = vec![
            BlobInfo {
                name: "a.log".into(),
                size: None,
                last_modified: Utc::now(),
                tags: Some(HashMap::new()),
            },
            BlobInfo {
                name: "b.log".into(),
                size: None,
                last_modified: Utc::now(),
                tags: Some(HashMap::new()),
            },
            BlobInfo {
                name: "c.log".into(),
                size: None,
                last_modified: Utc::now(),
                tags: Some(HashMap::new()),
            },
        ];
        let candidates = t.filter_candidates(listed).await.unwrap();
        assert_eq!(candidates.len(), 3);

        for info in &candidates {
            assert!(t.claim(&info.name).await.unwrap());
            t.mark_completed(&info.name).await.unwrap();
            t.release(&info.name).await.unwrap();
        }

        for name in ["a.log", "b.log", "c.log"] {
            let tags = store.tags_for_test("incoming", name).unwrap();
            assert_eq!(tags.get(STATUS).map(String::as_str), Some("completed"));
            assert!(!tags.contains_key(STARTED));
        }

        // Second cycle: nothing left to claim.
        let listed_again: Vec<BlobInfo> = ["a.log", "b.log", "c.log"]
            .iter()
            .map(|n| BlobInfo {
                name: (*n).to_string(),
                size: None,
                last_modified: Utc::now(),
                tags: store.tags_for_test("incoming", n),
            })
            .collect();
        let candidates = t.filter_candidates(listed_again).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn s2_user_tags_preserved_and_total_tags_bounded() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "x.log", "hello\n");
        let mut user_tags = HashMap::new();
        for i in 0..5 {
            user_tags.insert(format!("team{i}"), format!("v{i}"));
        }
        store.put_tags("incoming", "x.log", user_tags.clone());

        let t = tracker(store.clone());
        assert!(t.claim("x.log").await.unwrap());
        t.mark_completed("x.log").await.unwrap();
        t.release("x.log").await.unwrap();

        let tags = store.tags_for_test("incoming", "x.log").unwrap();
        for (k, v) in &user_tags {
            assert_eq!(tags.get(k), Some(v));
        }
        assert!(tags.len() <= 10);
    }

    #[tokio::test]
    async fn claim_conflict_returns_false() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "a.log", "x\n");
        let t1 = tracker(store.clone());
        let t2 = tracker(store);

        assert!(t1.claim("a.log").await.unwrap());
        assert!(!t2.claim("a.log").await.unwrap());
    }

    #[tokio::test]
    async fn mark_failed_sets_sanitized_error_and_keeps_status_failed() {
        let store = Arc::new(FakeStore::new());
        store.put_blob("incoming", "a.log", "x\n");
        let t = tracker(store.clone());

        assert!(t.claim("a.log").await.unwrap());
        t.mark_failed("a.log", "boom! <bad>").await.unwrap();
        t.release("a.log").await.unwrap();

        let tags = store.tags_for_test("incoming", "a.log").unwrap();
        assert_eq!(tags.get(STATUS).map(String::as_str), Some("failed"));
        assert_eq!(tags.get(ERROR).map(String::as_str), Some("boom_ _bad_"));

        // Eligible again next cycle.
        let listed = vec![BlobInfo {
            name: "a.log".into(),
            size: None,
            last_modified: Utc::now(),
            tags: Some(tags),
        }];
        assert_eq!(t.filter_candidates(listed).await.unwrap().len(), 1);
    }
}
