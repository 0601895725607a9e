//! Process-wide fault reporting.
//!
//! Key-scoped failures are retried locally; only give-ups, startup failures
//! and caught panics reach a [`FaultSink`].

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::error;

use crate::model::Key;
use crate::telemetry::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    /// A key exhausted its retries and was forgotten.
    GaveUp {
        key: Key,
        attempts: u32,
        error: String,
    },
    /// Shutdown arrived before the cache finished its initial listing.
    CacheSyncFailed,
    /// A handler invocation panicked; the worker survived.
    WorkerPanicked { key: Key, message: String },
}

impl Fault {
    pub fn name(&self) -> &'static str {
        match self {
            Fault::GaveUp { .. } => "gave_up",
            Fault::CacheSyncFailed => "cache_sync_failed",
            Fault::WorkerPanicked { .. } => "worker_panicked",
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::GaveUp {
                key,
                attempts,
                error,
            } => write!(f, "gave up on {key} after {attempts} attempts: {error}"),
            Fault::CacheSyncFailed => write!(f, "error syncing cache"),
            Fault::WorkerPanicked { key, message } => {
                write!(f, "handler panicked while reconciling {key}: {message}")
            }
        }
    }
}

pub trait FaultSink: Send + Sync {
    fn report(&self, fault: Fault);
}

/// Logs every fault at `error` and counts it.
#[derive(Debug, Default)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, fault: Fault) {
        error!(fault = fault.name(), "{fault}");
        metrics::faults().add(1, &[KeyValue::new("fault", fault.name())]);
    }
}

/// Logs like [`LogFaultSink`] and keeps every fault for later inspection.
#[derive(Debug, Default)]
pub struct RecordingFaultSink {
    faults: Mutex<Vec<(DateTime<Utc>, Fault)>>,
}

impl RecordingFaultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Faults with the time they were reported.
    pub fn timeline(&self) -> Vec<(DateTime<Utc>, Fault)> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FaultSink for RecordingFaultSink {
    fn report(&self, fault: Fault) {
        LogFaultSink.report(fault.clone());
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Utc::now(), fault));
    }
}
