//! Core data model.
//!
//! A work item says "something happened to the object with this key". The
//! queue deduplicates by key alone; the event kind and prior snapshot ride
//! along so the dispatcher knows which handler capability to call.

pub mod service;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Stable identifier of a watched object: `namespace/name`, or just `name`
/// for objects without a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from object metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        match meta.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{}", meta.name)),
            _ => Self(meta.name.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Object metadata + Resource trait
// ---------------------------------------------------------------------------

/// Identity metadata shared by every watched kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Bumped by the event source whenever the object's content changes.
    #[serde(default)]
    pub resource_version: u64,
}

/// A watched object kind. The queue, dispatcher and controller are generic
/// over this trait.
pub trait Resource: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> Key {
        Key::from_meta(self.meta())
    }
}

// ---------------------------------------------------------------------------
// Event kind
// ---------------------------------------------------------------------------

/// Which kind of change triggered a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

/// The unit placed on the work queue.
#[derive(Debug, Clone)]
pub struct WorkItem<O> {
    pub key: Key,
    pub kind: EventKind,
    /// Snapshot immediately before the change. `None` for `Created`.
    pub prior: Option<O>,
}

impl<O: Resource> WorkItem<O> {
    pub fn created(obj: &O) -> Self {
        Self {
            key: obj.key(),
            kind: EventKind::Created,
            prior: None,
        }
    }

    /// Keyed by the old object; the new state is read from the cache.
    pub fn updated(old: O) -> Self {
        Self {
            key: old.key(),
            kind: EventKind::Updated,
            prior: Some(old),
        }
    }

    pub fn deleted(obj: O) -> Self {
        Self {
            key: obj.key(),
            kind: EventKind::Deleted,
            prior: Some(obj),
        }
    }
}

impl<O> WorkItem<O> {
    /// A bare work item with no prior snapshot, for callers that only know
    /// the key (tests, manual requeues).
    pub fn keyed(key: impl Into<Key>, kind: EventKind) -> Self {
        Self {
            key: key.into(),
            kind,
            prior: None,
        }
    }
}
