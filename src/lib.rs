//! # reconcile-rs
//!
//! Level-triggered reconciliation controller.
//!
//! An event source keeps a local cache of watched objects and pushes change
//! notifications into a deduplicating work queue. Dispatcher workers pull
//! keys off the queue, look up the latest cached state, and hand it to a
//! reconcile handler. Failures are retried with exponential backoff until a
//! retry budget runs out, then reported to a fault sink.

pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod handler;
pub mod informer;
pub mod model;
pub mod queue;
pub mod telemetry;
