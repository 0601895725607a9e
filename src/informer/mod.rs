//! Informer side of the controller: the local cache of watched objects, the
//! event source that keeps it current, and the sink its notifications are
//! pushed into.

pub mod dir;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::model::{Key, Resource, WorkItem};
use crate::queue::WorkQueue;

pub use dir::DirectorySource;

/// Read side of the local object cache.
pub trait Cache<O>: Send + Sync {
    /// Last-known state of the object with this key.
    fn get_by_key(&self, key: &Key) -> Option<O>;

    /// Whether the initial listing has been loaded.
    fn has_synced(&self) -> bool;
}

/// Push callback for change notifications.
pub trait EventSink<O>: Send + Sync {
    fn on_add(&self, obj: &O);
    fn on_update(&self, old: &O, new: &O);
    fn on_delete(&self, obj: &O);
}

/// Background producer of change notifications.
///
/// Implementations must update their cache before pushing the matching
/// notification, so a worker that dequeues the key sees at least that state.
#[async_trait]
pub trait EventSource<O>: Send + Sync {
    /// Ingest until `stop` flips to `true`.
    async fn run(&self, sink: Arc<dyn EventSink<O>>, stop: watch::Receiver<bool>) -> Result<()>;

    fn has_synced(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory cache keyed by [`Key`].
pub struct Store<O> {
    objects: RwLock<HashMap<Key, O>>,
    synced: AtomicBool,
}

impl<O> Default for Store<O> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<O: Resource> Store<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object. Returns the previous state, if any.
    pub fn upsert(&self, obj: O) -> Option<O> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(obj.key(), obj)
    }

    pub fn remove(&self, key: &Key) -> Option<O> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// All cached objects, sorted by key.
    pub fn list(&self) -> Vec<O> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(&Key, &O)> = objects.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

impl<O: Resource> Cache<O> for Store<O> {
    fn get_by_key(&self, key: &Key) -> Option<O> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Queue sink
// ---------------------------------------------------------------------------

/// Turns change notifications into work queue entries.
pub struct QueueSink<O> {
    queue: WorkQueue<O>,
}

impl<O: Resource> QueueSink<O> {
    pub fn new(queue: WorkQueue<O>) -> Self {
        Self { queue }
    }
}

impl<O: Resource> EventSink<O> for QueueSink<O> {
    fn on_add(&self, obj: &O) {
        let item = WorkItem::created(obj);
        info!(key = %item.key, "resource added");
        self.queue.add(item);
    }

    fn on_update(&self, old: &O, _new: &O) {
        let item = WorkItem::updated(old.clone());
        info!(key = %item.key, "resource updated");
        self.queue.add(item);
    }

    fn on_delete(&self, obj: &O) {
        let item = WorkItem::deleted(obj.clone());
        info!(key = %item.key, "resource deleted");
        self.queue.add(item);
    }
}
