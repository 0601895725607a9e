//! Event source backed by a directory of TOML manifests.
//!
//! Every poll lists the directory, diffs the parsed objects against the
//! store and pushes one notification per difference. The first successful
//! listing marks the store synced.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Cache, EventSink, EventSource, Store};
use crate::error::{Error, Result};
use crate::model::{Key, Resource};

/// Result of parsing one directory listing.
#[derive(Debug)]
pub struct Listing<O> {
    /// Parsed objects with the file each came from, in path order.
    pub objects: Vec<(PathBuf, O)>,
    /// Files that could not be read or parsed.
    pub errors: Vec<Error>,
}

/// What a single poll changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: usize,
}

/// Parse every `*.toml` file in `dir`.
///
/// A missing or unreadable directory is an error; a bad file is recorded in
/// [`Listing::errors`] and skipped.
pub fn load_manifests<O: DeserializeOwned>(dir: &Path) -> Result<Listing<O>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("cannot read resource dir {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut objects = Vec::with_capacity(paths.len());
    let mut errors = Vec::new();
    for path in paths {
        match parse_manifest(&path) {
            Ok(obj) => objects.push((path, obj)),
            Err(e) => errors.push(e),
        }
    }

    Ok(Listing { objects, errors })
}

fn parse_manifest<O: DeserializeOwned>(path: &Path) -> Result<O> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| Error::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Polls a manifest directory and keeps a [`Store`] in step with it.
pub struct DirectorySource<O> {
    dir: PathBuf,
    poll_interval: Duration,
    store: Arc<Store<O>>,
    /// Key each manifest file produced on its last good parse. A file that
    /// stops parsing keeps its object alive instead of deleting it.
    files: Mutex<HashMap<PathBuf, Key>>,
}

impl<O> DirectorySource<O>
where
    O: Resource + DeserializeOwned + PartialEq,
{
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration, store: Arc<Store<O>>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            store,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store<O>> {
        &self.store
    }

    /// List the directory once and push the differences into `sink`.
    ///
    /// The store is updated before each notification is pushed.
    pub fn sync_once(&self, sink: &dyn EventSink<O>) -> Result<PollSummary> {
        let listing = load_manifests::<O>(&self.dir)?;
        let mut summary = PollSummary {
            errors: listing.errors.len(),
            ..PollSummary::default()
        };
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);

        let mut seen: HashSet<Key> = HashSet::new();
        for err in &listing.errors {
            warn!(error = %err, "skipping manifest");
            if let Error::Manifest { path, .. } = err {
                if let Some(key) = files.get(path) {
                    seen.insert(key.clone());
                }
            }
        }

        // one object per key, the later path winning, so each key is
        // compared and notified at most once per poll
        let mut current_files = HashMap::new();
        let mut desired: BTreeMap<Key, (PathBuf, O)> = BTreeMap::new();
        for (path, obj) in listing.objects {
            let key = obj.key();
            current_files.insert(path.clone(), key.clone());
            if let Some((earlier, _)) = desired.insert(key.clone(), (path, obj)) {
                warn!(key = %key, earlier = %earlier.display(), "duplicate key, later manifest wins");
            }
        }

        for (key, (_, mut obj)) in desired {
            seen.insert(key.clone());
            match self.store.get_by_key(&key) {
                None => {
                    obj.meta_mut().resource_version = 1;
                    self.store.upsert(obj.clone());
                    sink.on_add(&obj);
                    summary.added += 1;
                }
                Some(old) => {
                    obj.meta_mut().resource_version = old.meta().resource_version;
                    if obj != old {
                        obj.meta_mut().resource_version = old.meta().resource_version + 1;
                        self.store.upsert(obj.clone());
                        sink.on_update(&old, &obj);
                        summary.updated += 1;
                    }
                }
            }
        }

        for key in self.store.keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(old) = self.store.remove(&key) {
                sink.on_delete(&old);
                summary.deleted += 1;
            }
        }

        // files that failed this round keep their previous mapping
        files.retain(|path, _| {
            listing
                .errors
                .iter()
                .any(|e| matches!(e, Error::Manifest { path: p, .. } if p == path))
        });
        files.extend(current_files);

        if !self.store.has_synced() {
            self.store.mark_synced();
            info!(objects = self.store.len(), dir = %self.dir.display(), "initial listing complete");
        }

        Ok(summary)
    }
}

#[async_trait]
impl<O> EventSource<O> for DirectorySource<O>
where
    O: Resource + DeserializeOwned + PartialEq,
{
    async fn run(&self, sink: Arc<dyn EventSink<O>>, mut stop: watch::Receiver<bool>) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(dir = %self.dir.display(), poll_ms = self.poll_interval.as_millis() as u64, "directory source started");

        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    info!("directory source stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.sync_once(sink.as_ref()) {
                        Ok(summary) => debug!(?summary, "poll complete"),
                        Err(e) => warn!(error = %e, "poll failed"),
                    }
                }
            }
        }
    }

    fn has_synced(&self) -> bool {
        self.store.has_synced()
    }
}
