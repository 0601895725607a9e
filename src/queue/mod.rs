//! Deduplicating, rate-limited work queue with per-key mutual exclusion.
//!
//! Keys move between three disjoint places: *pending* (waiting for a
//! worker), *processing* (checked out by exactly one worker) and nowhere.
//! A key added while it is processing is marked *dirty* and goes back to
//! pending as soon as its checkout is released, so no change is lost and no
//! two workers ever hold the same key.
//!
//! [`WorkQueue::get`] hands out a [`Checkout`]; dropping it releases the
//! key. That is the only way to release a key, so every exit path of a
//! worker (success, error, panic unwinding) releases exactly once.

pub mod backoff;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::model::{Key, WorkItem};
use crate::telemetry::metrics;
use backoff::{ExponentialBackoff, FailureTracker};

/// What happened to an item handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New pending slot.
    Queued,
    /// Key was already pending; the slot was reused.
    Coalesced,
    /// Key is being processed; it will be requeued when released.
    Dirty,
    /// Queue is shutting down; the item was discarded.
    Dropped,
}

impl AddOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AddOutcome::Queued => "add",
            AddOutcome::Coalesced => "coalesced",
            AddOutcome::Dirty => "dirty",
            AddOutcome::Dropped => "dropped",
        }
    }
}

/// Whether an incoming payload replaces one already waiting for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    /// Fresh events: last writer wins.
    Replace,
    /// Delayed retries: an event that arrived meanwhile is newer.
    KeepExisting,
}

struct State<O> {
    pending: VecDeque<Key>,
    payloads: HashMap<Key, WorkItem<O>>,
    processing: HashSet<Key>,
    dirty: HashMap<Key, WorkItem<O>>,
    failures: FailureTracker,
    shutting_down: bool,
}

impl<O> State<O> {
    fn enqueue(&mut self, item: WorkItem<O>, payload: Payload) -> AddOutcome {
        if self.shutting_down {
            return AddOutcome::Dropped;
        }

        if self.processing.contains(&item.key) {
            if payload == Payload::Replace || !self.dirty.contains_key(&item.key) {
                self.dirty.insert(item.key.clone(), item);
            }
            return AddOutcome::Dirty;
        }

        if let Some(existing) = self.payloads.get_mut(&item.key) {
            if payload == Payload::Replace {
                *existing = item;
            }
            return AddOutcome::Coalesced;
        }

        self.pending.push_back(item.key.clone());
        self.payloads.insert(item.key.clone(), item);
        AddOutcome::Queued
    }
}

struct Inner<O> {
    state: Mutex<State<O>>,
    /// Wakes one `get` per newly pending key; all of them on shutdown.
    ready: Notify,
    /// Wakes `drain` when the processing set empties.
    idle: Notify,
    shutdown: watch::Sender<bool>,
}

impl<O> Inner<O> {
    fn lock(&self) -> MutexGuard<'_, State<O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, item: WorkItem<O>, payload: Payload) -> AddOutcome {
        let key = item.key.clone();
        let outcome = self.lock().enqueue(item, payload);
        if outcome == AddOutcome::Queued {
            self.ready.notify_one();
        }
        debug!(key = %key, outcome = outcome.as_str(), "enqueue");
        metrics::queue_adds().add(1, &[KeyValue::new("operation", outcome.as_str())]);
        outcome
    }

    fn release(&self, key: &Key) {
        let (promoted, idle) = {
            let mut state = self.lock();
            state.processing.remove(key);
            let promoted = match state.dirty.remove(key) {
                Some(item) if !state.shutting_down => {
                    state.pending.push_back(item.key.clone());
                    state.payloads.insert(item.key.clone(), item);
                    true
                }
                _ => false,
            };
            (promoted, state.processing.is_empty())
        };

        if promoted {
            debug!(key = %key, "dirty key requeued on release");
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }
}

/// Shared handle to one work queue. Cloning is cheap; all clones see the
/// same state.
pub struct WorkQueue<O> {
    inner: Arc<Inner<O>>,
}

impl<O> Clone for WorkQueue<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Send + 'static> WorkQueue<O> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    payloads: HashMap::new(),
                    processing: HashSet::new(),
                    dirty: HashMap::new(),
                    failures: FailureTracker::new(backoff),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Enqueue an item. Never blocks.
    ///
    /// A key that is already pending keeps its place in line and takes the
    /// new payload. A key that is processing is marked dirty instead.
    pub fn add(&self, item: WorkItem<O>) -> AddOutcome {
        self.inner.enqueue(item, Payload::Replace)
    }

    /// Enqueue an item after `delay` without blocking the caller.
    ///
    /// Must be called from within a Tokio runtime when `delay` is non-zero.
    /// Pending timers are abandoned on shutdown.
    pub fn add_after(&self, item: WorkItem<O>, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.inner.enqueue(item, Payload::KeepExisting);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    inner.enqueue(item, Payload::KeepExisting);
                }
                _ = shutdown.wait_for(|stopped| *stopped) => {}
            }
        });
    }

    /// Record a failure for the item's key and enqueue it after the
    /// resulting backoff delay. Returns the delay.
    pub fn add_rate_limited(&self, item: WorkItem<O>) -> Duration {
        let delay = self.inner.lock().failures.next_delay(&item.key);
        debug!(key = %item.key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        metrics::queue_adds().add(1, &[KeyValue::new("operation", "rate_limited")]);
        self.add_after(item, delay);
        delay
    }

    /// Wait for the next pending key and check it out.
    ///
    /// Returns `None` once the queue is shutting down; that answer is final.
    pub async fn get(&self) -> Option<Checkout<O>> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.lock();
                if state.shutting_down {
                    return None;
                }
                match state.pending.pop_front() {
                    Some(key) => {
                        let item = state.payloads.remove(&key);
                        if item.is_some() {
                            state.processing.insert(key);
                        }
                        Some((item, !state.pending.is_empty()))
                    }
                    None => None,
                }
            };

            match next {
                Some((Some(item), more)) => {
                    if more {
                        // pass the baton so a parked worker picks up the rest
                        self.inner.ready.notify_one();
                    }
                    return Some(Checkout {
                        queue: self.clone(),
                        item,
                        released: false,
                    });
                }
                Some((None, _)) => continue,
                None => notified.await,
            }
        }
    }

    /// Reset the failure counter for a key. Call after a success.
    pub fn forget(&self, key: &Key) {
        self.inner.lock().failures.forget(key);
    }

    /// Consecutive failures recorded for a key.
    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.inner.lock().failures.num_requeues(key)
    }

    /// Stop handing out keys. Idempotent.
    ///
    /// Pending and dirty keys are discarded, in-flight checkouts stay valid
    /// until released, and every current and future `get` returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.pending.clear();
            state.payloads.clear();
            state.dirty.clear();
        }
        self.inner.shutdown.send_replace(true);
        self.inner.ready.notify_waiters();
        debug!("work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Wait until no key is checked out.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently checked out.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }

    /// Whether `key` is checked out right now.
    pub fn is_processing(&self, key: &Key) -> bool {
        self.inner.lock().processing.contains(key)
    }
}

/// Exclusive hold on one key, handed out by [`WorkQueue::get`].
///
/// Dropping the checkout releases the key (the queue's `Done`). If the key
/// was re-added while checked out, it goes straight back to pending.
pub struct Checkout<O> {
    queue: WorkQueue<O>,
    item: WorkItem<O>,
    released: bool,
}

impl<O> Checkout<O> {
    pub fn key(&self) -> &Key {
        &self.item.key
    }

    pub fn item(&self) -> &WorkItem<O> {
        &self.item
    }

    /// Release the key now rather than at end of scope.
    pub fn done(self) {
        drop(self);
    }
}

impl<O> Drop for Checkout<O> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.queue.inner.release(&self.item.key);
        }
    }
}
