//! Exercises the tag-based tracker and the raw lease manager across
//! multiple "replicas" sharing one fake store, driven entirely through the
//! crate's public API (no access to crate-internal types).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobwatch_core::lease::LeaseManager;
use blobwatch_core::streamer::Event;
use blobwatch_core::test_util::FakeStore;
use blobwatch_core::{ObjectStore, Orchestrator, Tracker};

fn collecting_sink() -> (blobwatch_core::streamer::EventSink, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    let sink: blobwatch_core::streamer::EventSink = Arc::new(move |e| events2.lock().unwrap().push(e));
    (sink, events)
}

#[tokio::test]
async fn s3_two_replicas_every_blob_ends_completed_and_none_are_lost() {
    let store = Arc::new(FakeStore::new());
    for i in 0..10 {
        store.put_blob("incoming", &format!("blob-{i:02}.log"), "line1\nline2\n");
    }
    let store: Arc<dyn ObjectStore> = store;

    let tracker_c1 = Arc::new(Tracker::tags(store.clone(), "incoming", "c1", Duration::from_secs(30), Duration::from_secs(20)));
    let tracker_c2 = Arc::new(Tracker::tags(store.clone(), "incoming", "c2", Duration::from_secs(30), Duration::from_secs(20)));

    let (sink1, _events1) = collecting_sink();
    let (sink2, _events2) = collecting_sink();

    let orch1 = Orchestrator::builder(store.clone(), tracker_c1, "incoming", "acct", sink1).build();
    let orch2 = Orchestrator::builder(store.clone(), tracker_c2, "incoming", "acct", sink2).build();

    let (s1, s2) = tokio::join!(orch1.poll_once(), orch2.poll_once());
    let s1 = s1.unwrap();
    let s2 = s2.unwrap();

    assert_eq!(s1.blobs_processed + s2.blobs_processed, 10, "every blob processed exactly once across both replicas");
    assert_eq!(s1.blobs_failed, 0);
    assert_eq!(s2.blobs_failed, 0);

    for i in 0..10 {
        let name = format!("blob-{i:02}.log");
        let tags = store.get_tags("incoming", &name).await.expect("blob still present");
        assert_eq!(tags.get("logstash_status").map(String::as_str), Some("completed"));
        let processor = tags.get("logstash_processor").map(String::as_str);
        assert!(processor == Some("c1") || processor == Some("c2"));
    }
}

// FakeStore's lease expiry is computed against the real wall clock
// (`chrono::Utc::now`), which a paused tokio clock does not advance, so this
// test needs a real sleep rather than `start_paused`.
#[tokio::test]
async fn s4_second_claimant_waits_for_lease_expiry_then_succeeds() {
    let store = Arc::new(FakeStore::new());
    store.put_blob("incoming", "x.log", "line1\n");
    let store: Arc<dyn ObjectStore> = store;

    let a = LeaseManager::new(store.clone(), "incoming", "x.log", Duration::from_millis(200));
    let b = LeaseManager::new(store, "incoming", "x.log", Duration::from_millis(200));

    a.acquire().await.unwrap().expect("a acquires");
    // a is "killed" without releasing.
    assert!(b.acquire().await.unwrap().is_none(), "b must not acquire while a's lease is live");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(b.acquire().await.unwrap().is_some(), "b acquires once a's lease has expired");
}
