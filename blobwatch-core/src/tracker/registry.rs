//! Local-registry state tracker (spec §4.3.C): single-replica only, state
//! lives in an embedded SQLite database. No object-storage permissions
//! beyond reading blob bytes are required, and no leases are used.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::object_store::BlobInfo;

use super::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blobs (
  name TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT,
  error TEXT,
  processor TEXT
);
CREATE INDEX IF NOT EXISTS idx_status ON blobs(status);
";

/// The local-registry tracker.
pub struct RegistryTracker {
    conn: Arc<Mutex<Connection>>,
    processor: String,
}

impl RegistryTracker {
    /// Opens (or creates) the registry database at `path`, applying the
    /// wire-exact schema from spec §6.
    pub(crate) fn open(path: &str, processor: impl Into<String>) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            processor: processor.into(),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("registry connection mutex poisoned");
            f(&conn)
        })
        .await
        .expect("registry blocking task panicked")
        .map_err(Error::from)
    }

    pub(crate) async fn filter_candidates(&self, blobs: Vec<BlobInfo>) -> Result<Vec<BlobInfo>, Error> {
        let names: Vec<String> = blobs.iter().map(|b| b.name.clone()).collect();
        let statuses = self
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT status FROM blobs WHERE name = ?1")?;
                let mut out = Vec::with_capacity(names.len());
                for name in &names {
                    let status: Option<String> = stmt.query_row(params![name], |row| row.get(0)).optional()?;
                    out.push(status);
                }
                Ok(out)
            })
            .await?;

        Ok(blobs
            .into_iter()
            .zip(statuses)
            .filter(|(_, status)| status.as_deref() != Some("completed"))
            .map(|(blob, _)| blob)
            .collect())
    }

    pub(crate) async fn claim(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        let processor = self.processor.clone();
        let started = Utc::now().to_rfc3339();
        let rows = self
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO blobs (name, status, started_at, processor) VALUES (?1, 'processing', ?2, ?3)
                     ON CONFLICT(name) DO NOTHING",
                    params![name, started, processor],
                )
            })
            .await?;
        Ok(rows == 1)
    }

    async fn mark_terminal(&self, name: &str, status: &str, error: Option<String>) -> Result<(), Error> {
        let name = name.to_string();
        let status = status.to_string();
        let processor = self.processor.clone();
        let completed = Utc::now().to_rfc3339();
        self.run(move |conn| {
            conn.execute(
                "UPDATE blobs SET status = ?1, completed_at = ?2, error = ?3, processor = ?4 WHERE name = ?5",
                params![status, completed, error, processor, name],
            )
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn mark_completed(&self, name: &str) -> Result<(), Error> {
        self.mark_terminal(name, "completed", None).await
    }

    pub(crate) async fn mark_failed(&self, name: &str, reason: &str) -> Result<(), Error> {
        self.mark_terminal(name, "failed", Some(reason.to_string())).await
    }

    pub(crate) async fn release(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM blobs WHERE name = ?1 AND status = 'processing'",
                params![name],
            )
        })
        .await?;
        Ok(())
    }

    pub(crate) fn was_lease_renewal_compromised(&self, _name: &str) -> bool {
        false
    }

    pub(crate) async fn close(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn tracker() -> RegistryTracker {
        RegistryTracker::open(":memory:", "host-1").unwrap()
    }

    #[tokio::test]
    async fn claim_is_exclusive_via_primary_key() {
        let t = tracker();
        assert!(t.claim("a.log").await.unwrap());
        assert!(!t.claim("a.log").await.unwrap());
    }

    #[tokio::test]
    async fn mark_completed_then_filter_excludes_it() {
        let t = tracker();
        assert!(t.claim("a.log").await.unwrap());
        t.mark_completed("a.log").await.unwrap();

        let listed = vec![BlobInfo {
            name: "a.log".into(),
            size: None,
            last_modified: Utc::now(),
            tags: None,
        }];
        assert!(t.filter_candidates(listed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_failed_then_filter_still_includes_it() {
        let t = tracker();
        assert!(t.claim("a.log").await.unwrap());
        t.mark_failed("a.log", "boom").await.unwrap();

        let listed = vec![BlobInfo {
            name: "a.log".into(),
            size: None,
            last_modified: Utc::now(),
            tags: None,
        }];
        assert_eq!(t.filter_candidates(listed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn s6_release_deletes_leftover_processing_row_so_it_can_be_reclaimed() {
        let t = tracker();
        assert!(t.claim("y.log").await.unwrap());
        // Simulate a crash: nothing marks this terminal before release runs.
        t.release("y.log").await.unwrap();
        assert!(t.claim("y.log").await.unwrap());
    }

    #[tokio::test]
    async fn release_does_not_touch_terminal_rows() {
        let t = tracker();
        assert!(t.claim("a.log").await.unwrap());
        t.mark_completed("a.log").await.unwrap();
        t.release("a.log").await.unwrap();

        let listed = vec![BlobInfo {
            name: "a.log".into(),
            size: None,
            last_modified: Utc::now(),
            tags: None,
        }];
        assert!(t.filter_candidates(listed).await.unwrap().is_empty());
    }
}
