//! Integration tests for the cache, the queue sink and the directory source.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconcile_rs::error::Error;
use reconcile_rs::informer::dir::{PollSummary, load_manifests};
use reconcile_rs::informer::{Cache, DirectorySource, EventSink, EventSource, QueueSink, Store};
use reconcile_rs::model::service::HttpService;
use reconcile_rs::model::{EventKind, Key, Resource};
use reconcile_rs::queue::WorkQueue;
use reconcile_rs::queue::backoff::ExponentialBackoff;

/// Collects notifications as short strings, checking the store was
/// updated first.
struct RecordingSink {
    store: Arc<Store<HttpService>>,
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn new(store: Arc<Store<HttpService>>) -> Self {
        Self {
            store,
            events: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink<HttpService> for RecordingSink {
    fn on_add(&self, obj: &HttpService) {
        assert!(self.store.get_by_key(&obj.key()).is_some());
        self.events.lock().unwrap().push(format!("add {}", obj.key()));
    }

    fn on_update(&self, old: &HttpService, new: &HttpService) {
        assert_eq!(self.store.get_by_key(&new.key()).as_ref(), Some(new));
        self.events.lock().unwrap().push(format!(
            "update {} {}->{} v{}",
            new.key(),
            old.spec.image,
            new.spec.image,
            new.metadata.resource_version
        ));
    }

    fn on_delete(&self, obj: &HttpService) {
        assert!(self.store.get_by_key(&obj.key()).is_none());
        self.events.lock().unwrap().push(format!("delete {}", obj.key()));
    }
}

fn write(dir: &Path, file: &str, body: &str) {
    std::fs::write(dir.join(file), body).unwrap();
}

fn manifest(name: &str, image: &str) -> String {
    format!("[metadata]\nname = \"{name}\"\n\n[spec]\nimage = \"{image}\"\n")
}

fn source(dir: &Path) -> (DirectorySource<HttpService>, Arc<Store<HttpService>>) {
    let store = Arc::new(Store::new());
    let source = DirectorySource::new(dir, Duration::from_millis(10), Arc::clone(&store));
    (source, store)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[test]
fn store_upsert_get_remove() {
    let store = Store::<HttpService>::new();
    assert!(!store.has_synced());
    assert!(store.is_empty());

    assert!(store.upsert(HttpService::new("b", "img:1", 1)).is_none());
    assert!(store.upsert(HttpService::new("a", "img:1", 1)).is_none());
    let prev = store.upsert(HttpService::new("b", "img:2", 1));
    assert_eq!(prev.map(|s| s.spec.image), Some("img:1".to_string()));

    assert_eq!(store.keys(), vec![Key::from("a"), Key::from("b")]);
    assert_eq!(
        store.get_by_key(&Key::from("b")).map(|s| s.spec.image),
        Some("img:2".to_string())
    );
    assert_eq!(store.list().len(), 2);

    assert!(store.remove(&Key::from("a")).is_some());
    assert!(store.get_by_key(&Key::from("a")).is_none());
    assert_eq!(store.len(), 1);

    store.mark_synced();
    assert!(store.has_synced());
}

// ---------------------------------------------------------------------------
// Queue sink
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_sink_turns_notifications_into_work_items() {
    let queue: WorkQueue<HttpService> = WorkQueue::new(ExponentialBackoff::new(
        Duration::from_millis(5),
        Duration::from_secs(1),
    ));
    let sink = QueueSink::new(queue.clone());
    let old = HttpService::new("web", "nginx:1", 1).in_namespace("prod");
    let new = HttpService::new("web", "nginx:2", 1).in_namespace("prod");

    sink.on_add(&old);
    let c = queue.get().await.unwrap();
    assert_eq!(c.key(), &Key::from("prod/web"));
    assert_eq!(c.item().kind, EventKind::Created);
    assert!(c.item().prior.is_none());
    c.done();

    sink.on_update(&old, &new);
    let c = queue.get().await.unwrap();
    assert_eq!(c.item().kind, EventKind::Updated);
    assert_eq!(c.item().prior.as_ref(), Some(&old));
    c.done();

    sink.on_delete(&new);
    let c = queue.get().await.unwrap();
    assert_eq!(c.item().kind, EventKind::Deleted);
    assert_eq!(c.item().prior.as_ref(), Some(&new));
}

// ---------------------------------------------------------------------------
// Directory source
// ---------------------------------------------------------------------------

#[test]
fn first_sync_adds_everything_and_marks_synced() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", &manifest("a", "img:1"));
    write(dir.path(), "b.toml", &manifest("b", "img:1"));
    write(dir.path(), "notes.txt", "ignored");

    let (source, store) = source(dir.path());
    let sink = RecordingSink::new(Arc::clone(&store));
    let summary = source.sync_once(&sink).unwrap();

    assert_eq!(
        summary,
        PollSummary {
            added: 2,
            ..PollSummary::default()
        }
    );
    assert_eq!(sink.take(), vec!["add a", "add b"]);
    assert!(store.has_synced());
    assert_eq!(
        store.get_by_key(&Key::from("a")).unwrap().metadata.resource_version,
        1
    );
}

#[test]
fn unchanged_listing_emits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", &manifest("a", "img:1"));
    let (source, store) = source(dir.path());
    let sink = RecordingSink::new(store);

    source.sync_once(&sink).unwrap();
    sink.take();
    assert_eq!(source.sync_once(&sink).unwrap(), PollSummary::default());
    assert!(sink.take().is_empty());
}

#[test]
fn changed_and_removed_files_emit_update_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", &manifest("a", "img:1"));
    write(dir.path(), "b.toml", &manifest("b", "img:1"));
    let (source, store) = source(dir.path());
    let sink = RecordingSink::new(Arc::clone(&store));
    source.sync_once(&sink).unwrap();
    sink.take();

    write(dir.path(), "a.toml", &manifest("a", "img:2"));
    std::fs::remove_file(dir.path().join("b.toml")).unwrap();
    let summary = source.sync_once(&sink).unwrap();

    assert_eq!((summary.updated, summary.deleted), (1, 1));
    assert_eq!(sink.take(), vec!["update a img:1->img:2 v2", "delete b"]);
    assert_eq!(store.keys(), vec![Key::from("a")]);
}

#[test]
fn malformed_file_keeps_last_good_object() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", &manifest("a", "img:1"));
    let (source, store) = source(dir.path());
    let sink = RecordingSink::new(Arc::clone(&store));
    source.sync_once(&sink).unwrap();
    sink.take();

    write(dir.path(), "a.toml", "[metadata\nname = ");
    let summary = source.sync_once(&sink).unwrap();
    assert_eq!(summary.errors, 1);
    assert!(sink.take().is_empty());
    assert!(store.get_by_key(&Key::from("a")).is_some());

    // fixed on the next round
    write(dir.path(), "a.toml", &manifest("a", "img:3"));
    source.sync_once(&sink).unwrap();
    assert_eq!(sink.take(), vec!["update a img:1->img:3 v2"]);
}

#[test]
fn duplicate_key_settles_on_later_manifest() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", &manifest("dup", "img:a"));
    write(dir.path(), "b.toml", &manifest("dup", "img:b"));
    let (source, store) = source(dir.path());
    let sink = RecordingSink::new(Arc::clone(&store));

    let first = source.sync_once(&sink).unwrap();
    assert_eq!((first.added, first.updated), (1, 0));
    assert_eq!(sink.take(), vec!["add dup"]);
    let cached = store.get_by_key(&Key::from("dup")).unwrap();
    assert_eq!(cached.spec.image, "img:b");
    assert_eq!(cached.metadata.resource_version, 1);

    // nothing changed on disk, so nothing is emitted
    for _ in 0..2 {
        assert_eq!(source.sync_once(&sink).unwrap(), PollSummary::default());
        assert!(sink.take().is_empty());
    }
    assert_eq!(
        store.get_by_key(&Key::from("dup")).unwrap().metadata.resource_version,
        1
    );

    // dropping the winner falls back to the other file
    std::fs::remove_file(dir.path().join("b.toml")).unwrap();
    source.sync_once(&sink).unwrap();
    assert_eq!(sink.take(), vec!["update dup img:b->img:a v2"]);
}

#[tokio::test]
async fn zero_poll_interval_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::<HttpService>::new());
    let source = DirectorySource::new(dir.path(), Duration::ZERO, Arc::clone(&store));
    let sink: Arc<dyn EventSink<HttpService>> = Arc::new(RecordingSink::new(Arc::clone(&store)));
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let result = source.run(sink, stop_rx).await;
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(!store.has_synced());
}

#[test]
fn missing_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (source, store) = source(&dir.path().join("nope"));
    let sink = RecordingSink::new(Arc::clone(&store));

    assert!(source.sync_once(&sink).is_err());
    assert!(!store.has_synced());
}

#[test]
fn load_manifests_reports_bad_files_separately() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "good.toml", &manifest("good", "img:1"));
    write(dir.path(), "bad.toml", "spec = 3");

    let listing = load_manifests::<HttpService>(dir.path()).unwrap();
    assert_eq!(listing.objects.len(), 1);
    assert_eq!(listing.objects[0].1.spec.access_mode, 1);
    assert_eq!(listing.errors.len(), 1);
    assert!(listing.errors[0].to_string().contains("bad.toml"));
}
