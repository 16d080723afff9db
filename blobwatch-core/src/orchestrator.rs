//! Wires the lease manager, line streamer, and state tracker into one poll
//! cycle (spec §4.4): sequential, bounded discovery followed by parallel,
//! bounded processing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::object_store::{BlobInfo, ObjectStore};
use crate::shutdown::Stopped;
use crate::streamer::{self, BlobMeta, EventSink};
use crate::tracker::{self, Tracker};

/// Default discovery page size (spec §4.4 "page size ≈ 5,000").
const DEFAULT_PAGE_SIZE: usize = 5_000;

/// Errors that propagate out of `poll_once` itself — listing or filtering
/// failures (spec §7 propagation policy). Per-blob failures never reach
/// here; they are caught at the task boundary and folded into the summary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listing the container failed.
    #[error(transparent)]
    Store(#[from] crate::object_store::StoreError),

    /// `filter_candidates` or `claim` failed for a reason other than a
    /// normal conflict.
    #[error(transparent)]
    Tracker(#[from] tracker::Error),
}

/// The outcome of one `poll_once` call (spec §6 "Cycle-summary value").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Blobs that completed successfully.
    pub blobs_processed: u64,
    /// Blobs marked failed (interrupted, compromised, or erroring).
    pub blobs_failed: u64,
    /// Candidates whose claim lost to another worker.
    pub blobs_skipped: u64,
    /// Total events emitted across all processed/failed blobs.
    pub events_produced: u64,
    /// Wall-clock duration of the cycle.
    pub duration_ms: u64,
}

/// Builds an [`Orchestrator`] with the teacher's builder-then-build idiom;
/// only the object store, tracker, container, and event sink are required.
pub struct Builder {
    store: Arc<dyn ObjectStore>,
    tracker: Arc<Tracker>,
    container: String,
    storage_account: String,
    sink: EventSink,
    prefix: Option<String>,
    page_size: usize,
    batch_size: usize,
    concurrency: usize,
    skip_empty_lines: bool,
    stopped: Stopped,
}

impl Builder {
    /// Starts a builder with every required collaborator.
    pub fn new(store: Arc<dyn ObjectStore>, tracker: Arc<Tracker>, container: impl Into<String>, storage_account: impl Into<String>, sink: EventSink) -> Self {
        Self {
            store,
            tracker,
            container: container.into(),
            storage_account: storage_account.into(),
            sink,
            prefix: None,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: 1_000,
            concurrency: 4,
            skip_empty_lines: false,
            stopped: Stopped::new(),
        }
    }

    /// Restricts discovery to blobs whose name starts with `prefix`.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Overrides the discovery page size (default 5,000).
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Overrides the per-cycle claim cap (default 1,000).
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overrides the processing worker-pool size (default 4).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets whether the streamer skips empty lines.
    #[must_use]
    pub fn skip_empty_lines(mut self, skip: bool) -> Self {
        self.skip_empty_lines = skip;
        self
    }

    /// Shares a process-wide cancellation flag with the outer run loop
    /// instead of an orchestrator-private one.
    #[must_use]
    pub fn stopped(mut self, stopped: Stopped) -> Self {
        self.stopped = stopped;
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            store: self.store,
            tracker: self.tracker,
            container: self.container,
            storage_account: self.storage_account,
            sink: self.sink,
            prefix: self.prefix,
            page_size: self.page_size,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            skip_empty_lines: self.skip_empty_lines,
            stopped: self.stopped,
        }
    }
}

/// Runs one poll cycle at a time: list, filter, claim, process, mark,
/// release (spec §4.4). Holds no per-cycle state between calls other than
/// what lives in its tracker.
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    tracker: Arc<Tracker>,
    container: String,
    storage_account: String,
    sink: EventSink,
    prefix: Option<String>,
    page_size: usize,
    batch_size: usize,
    concurrency: usize,
    skip_empty_lines: bool,
    stopped: Stopped,
}

impl Orchestrator {
    /// Starts a builder for an orchestrator over `container`.
    pub fn builder(store: Arc<dyn ObjectStore>, tracker: Arc<Tracker>, container: impl Into<String>, storage_account: impl Into<String>, sink: EventSink) -> Builder {
        Builder::new(store, tracker, container, storage_account, sink)
    }

    /// The cancellation flag this orchestrator polls. Clone it to share it
    /// with the outer run loop's signal handler.
    #[must_use]
    pub fn stopped(&self) -> &Stopped {
        &self.stopped
    }

    /// Runs one full cycle and returns its summary. Listing and filtering
    /// failures propagate (spec §7); per-blob failures are folded into the
    /// summary instead.
    pub async fn poll_once(&self) -> Result<CycleSummary, Error> {
        let start = Instant::now();
        let span = tracing::info_span!("poll_cycle", container = %self.container);
        async {
            let (claimed, skipped) = self.discover().await?;
            let (processed, failed, events) = self.process(claimed).await;

            let summary = CycleSummary {
                blobs_processed: processed,
                blobs_failed: failed,
                blobs_skipped: skipped,
                events_produced: events,
                duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            };

            tracing::info!(
                processed = summary.blobs_processed,
                failed = summary.blobs_failed,
                skipped = summary.blobs_skipped,
                events = summary.events_produced,
                duration_ms = summary.duration_ms,
                "cycle complete"
            );

            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Phase 1: sequential, streaming discovery. Lists page by page, filters
    /// each page, and claims survivors up to `batch_size`.
    async fn discover(&self) -> Result<(Vec<BlobInfo>, u64), Error> {
        let mut claimed = Vec::with_capacity(self.batch_size);
        let mut skipped: u64 = 0;
        let mut continuation = None;

        loop {
            if self.stopped.is_stopped() || claimed.len() >= self.batch_size {
                break;
            }

            let page = self
                .store
                .list_blobs(&self.container, self.prefix.as_deref(), continuation.take(), self.page_size)
                .await?;

            let candidates = self.tracker.filter_candidates(page.blobs).await?;

            for info in candidates {
                if self.stopped.is_stopped() || claimed.len() >= self.batch_size {
                    break;
                }
                match self.tracker.claim(&info.name).await {
                    Ok(true) => claimed.push(info),
                    Ok(false) => skipped += 1,
                    Err(error) => {
                        // Must not unwind past blobs already claimed earlier in this loop.
                        tracing::warn!(blob = %info.name, %error, "claim failed, skipping blob this cycle");
                        skipped += 1;
                    }
                }
            }

            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        Ok((claimed, skipped))
    }

    /// Phase 2: parallel, bounded processing. Runs at most `concurrency`
    /// tasks at once over `claimed`.
    async fn process(&self, claimed: Vec<BlobInfo>) -> (u64, u64, u64) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks = tokio::task::JoinSet::new();

        for info in claimed {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let tracker = self.tracker.clone();
            let sink = self.sink.clone();
            let stopped = self.stopped.clone();
            let container = self.container.clone();
            let storage_account = self.storage_account.clone();
            let skip_empty_lines = self.skip_empty_lines;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                process_one(&store, &tracker, &sink, &stopped, &container, &storage_account, skip_empty_lines, info).await
            });
        }

        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut events = 0u64;
        while let Some(result) = tasks.join_next().await {
            let outcome = result.expect("worker task panicked");
            events += outcome.events;
            if outcome.failed {
                failed += 1;
            } else {
                processed += 1;
            }
        }

        (processed, failed, events)
    }
}

struct WorkerOutcome {
    events: u64,
    failed: bool,
}

/// Runs exactly one claimed blob's lifecycle (spec §4.4 Phase 2, steps 1-5).
/// Never propagates an error: every failure mode is translated into
/// `mark_failed` and the claim is always released.
#[allow(clippy::too_many_arguments)]
async fn process_one(
    store: &Arc<dyn ObjectStore>,
    tracker: &Arc<Tracker>,
    sink: &EventSink,
    stopped: &Stopped,
    container: &str,
    storage_account: &str,
    skip_empty_lines: bool,
    info: BlobInfo,
) -> WorkerOutcome {
    let name = info.name.as_str();
    let outcome = run_one(store, sink, stopped, container, storage_account, skip_empty_lines, &info).await;

    let (failed, events, mark_result) = match outcome {
        Ok(result) if result.completed => {
            if tracker.was_lease_renewal_compromised(name) {
                (true, result.event_count, tracker.mark_failed(name, "lease renewal failed during processing").await)
            } else {
                (false, result.event_count, tracker.mark_completed(name).await)
            }
        }
        Ok(result) => (true, result.event_count, tracker.mark_failed(name, "interrupted").await),
        Err(error) => {
            tracing::warn!(blob = name, %error, "blob processing failed");
            (true, 0, tracker.mark_failed(name, &error.to_string()).await)
        }
    };

    if let Err(error) = mark_result {
        tracing::warn!(blob = name, %error, "failed to record terminal state");
    }
    if let Err(error) = tracker.release(name).await {
        tracing::warn!(blob = name, %error, "failed to release claim");
    }

    WorkerOutcome { events, failed }
}

#[derive(Debug, thiserror::Error)]
enum RunOneError {
    #[error(transparent)]
    Store(#[from] crate::object_store::StoreError),
    #[error(transparent)]
    Streamer(#[from] streamer::Error),
}

async fn run_one(
    store: &Arc<dyn ObjectStore>,
    sink: &EventSink,
    stopped: &Stopped,
    container: &str,
    storage_account: &str,
    skip_empty_lines: bool,
    info: &BlobInfo,
) -> Result<streamer::StreamResult, RunOneError> {
    let reader = store.open_read_stream(container, &info.name).await?;
    // Re-read rather than trust the listing-time value: the blob was claimed
    // (and may have been re-uploaded) some time after it was listed.
    let last_modified = store.last_modified(container, &info.name).await?;
    let meta = BlobMeta {
        blob_name: info.name.clone(),
        container: container.to_string(),
        storage_account: storage_account.to_string(),
        last_modified,
    };
    let result = streamer::stream_lines(reader, &meta, sink, skip_empty_lines, || stopped.is_stopped()).await?;
    Ok(result)
}
