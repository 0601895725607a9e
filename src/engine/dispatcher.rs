//! Dispatcher: drain the queue, resolve each key through the cache, call the
//! reconcile handler, and feed the outcome back into the queue.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::fault::{Fault, FaultSink};
use crate::handler::ReconcileHandler;
use crate::informer::Cache;
use crate::model::{EventKind, Resource, WorkItem};
use crate::queue::{Checkout, WorkQueue};
use crate::telemetry::metrics;
use crate::telemetry::reconcile::{record_outcome, start_reconcile_span};

/// How one checkout ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    /// Failed; requeued with backoff. `attempt` is the attempt that failed.
    Requeued { attempt: u32, delay: Duration },
    /// Failed with retries exhausted; forgotten and reported.
    GaveUp { attempts: u32 },
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Succeeded => "success",
            ProcessOutcome::Requeued { .. } => "retry",
            ProcessOutcome::GaveUp { .. } => "give_up",
        }
    }
}

pub struct Dispatcher<O> {
    queue: WorkQueue<O>,
    cache: Arc<dyn Cache<O>>,
    handler: Arc<dyn ReconcileHandler<O>>,
    faults: Arc<dyn FaultSink>,
    max_retries: u32,
}

impl<O> Clone for Dispatcher<O> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            cache: Arc::clone(&self.cache),
            handler: Arc::clone(&self.handler),
            faults: Arc::clone(&self.faults),
            max_retries: self.max_retries,
        }
    }
}

impl<O: Resource> Dispatcher<O> {
    pub fn new(
        queue: WorkQueue<O>,
        cache: Arc<dyn Cache<O>>,
        handler: Arc<dyn ReconcileHandler<O>>,
        faults: Arc<dyn FaultSink>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            cache,
            handler,
            faults,
            max_retries,
        }
    }

    /// Process items until the queue shuts down.
    pub async fn run_worker(&self, worker_id: usize) {
        info!(worker_id, "worker starting");
        while self.process_next_item().await.is_some() {}
        info!(worker_id, "worker completed");
    }

    /// Check out and process one item. `None` means the queue shut down.
    pub async fn process_next_item(&self) -> Option<ProcessOutcome> {
        let checkout = self.queue.get().await?;
        Some(self.process(checkout).await)
    }

    /// Reconcile one checked-out item. The checkout is released when this
    /// returns, after any requeue has been scheduled.
    pub async fn process(&self, checkout: Checkout<O>) -> ProcessOutcome {
        let item = checkout.item().clone();
        let attempt = self.queue.num_requeues(&item.key) + 1;
        let span = start_reconcile_span(&item.key, item.kind, attempt);

        let outcome = async {
            let started = Instant::now();
            let result = self.invoke(&item).await;
            metrics::reconcile_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("kind", item.kind.to_string())],
            );

            match result {
                Ok(()) => {
                    self.queue.forget(&item.key);
                    info!(key = %item.key, kind = %item.kind, "reconciled");
                    ProcessOutcome::Succeeded
                }
                Err(err) => self.handle_error(item.clone(), attempt, err),
            }
        }
        .instrument(span.clone())
        .await;

        record_outcome(&span, outcome.as_str());
        metrics::reconcile_items().add(1, &[KeyValue::new("outcome", outcome.as_str())]);
        drop(checkout);
        outcome
    }

    fn handle_error(&self, item: WorkItem<O>, attempt: u32, err: Error) -> ProcessOutcome {
        let key = item.key.clone();
        if self.queue.num_requeues(&key) < self.max_retries {
            warn!(key = %key, attempt, error = %err, "error processing item (will retry)");
            let delay = self.queue.add_rate_limited(item);
            metrics::reconcile_retries().add(1, &[]);
            ProcessOutcome::Requeued { attempt, delay }
        } else {
            error!(key = %key, attempt, error = %err, "error processing item (giving up)");
            self.queue.forget(&key);
            metrics::reconcile_give_ups().add(1, &[]);
            self.faults.report(Fault::GaveUp {
                key,
                attempts: attempt,
                error: err.to_string(),
            });
            ProcessOutcome::GaveUp { attempts: attempt }
        }
    }

    /// Resolve the item against the cache and run the matching handler
    /// capability on its own task, so a panic becomes an error value.
    async fn invoke(&self, item: &WorkItem<O>) -> Result<()> {
        let current = self.cache.get_by_key(&item.key);
        let handler = Arc::clone(&self.handler);

        let task = match (item.kind, current, item.prior.clone()) {
            (EventKind::Created, Some(current), _) => {
                tokio::spawn(async move { handler.created(&current).await })
            }
            (EventKind::Updated, Some(current), prior) => {
                let prior = prior.unwrap_or_else(|| current.clone());
                tokio::spawn(async move { handler.updated(&prior, &current).await })
            }
            (EventKind::Deleted, _, Some(prior)) => {
                tokio::spawn(async move { handler.deleted(&prior).await })
            }
            (EventKind::Deleted, Some(current), None) => {
                tokio::spawn(async move { handler.deleted(&current).await })
            }
            (EventKind::Deleted, None, None) => {
                warn!(key = %item.key, "delete with no prior state and no cached object, nothing to do");
                return Ok(());
            }
            (EventKind::Created | EventKind::Updated, None, _) => {
                return Err(Error::NotFound(format!(
                    "error fetching object with key {} from store",
                    item.key
                )));
            }
        };

        match task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                self.faults.report(Fault::WorkerPanicked {
                    key: item.key.clone(),
                    message: message.clone(),
                });
                Err(Error::Panicked(message))
            }
            Err(join_err) => Err(Error::Other(format!("handler task cancelled: {join_err}"))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
