//! Controller: start the event source, wait for the cache, run workers,
//! drain on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultSink, LogFaultSink};
use crate::handler::ReconcileHandler;
use crate::informer::{Cache, EventSink, EventSource, QueueSink};
use crate::model::Resource;
use crate::queue::WorkQueue;
use crate::queue::backoff::ExponentialBackoff;

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of dispatcher workers. At least 1.
    pub workers: usize,
    /// Failed attempts retried before a key is given up on.
    pub max_retries: u32,
    /// First retry delay; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Upper bound on any retry delay.
    pub backoff_cap: Duration,
    /// How often the initial-sync wait re-checks the cache.
    pub sync_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_secs(1000),
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(Error::Config(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        if self.sync_poll_interval.is_zero() {
            return Err(Error::Config("sync poll interval must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_cap)
    }
}

/// Lifecycle state of a controller. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl ControllerState {
    pub fn can_transition_to(self, to: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Created, Stopped) // startup aborted
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerState::Created => "created",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Owns the work queue and wires the event source, cache and handler
/// together.
pub struct Controller<O> {
    config: ControllerConfig,
    queue: WorkQueue<O>,
    source: Arc<dyn EventSource<O>>,
    cache: Arc<dyn Cache<O>>,
    handler: Arc<dyn ReconcileHandler<O>>,
    faults: Arc<dyn FaultSink>,
    state: watch::Sender<ControllerState>,
}

impl<O: Resource> Controller<O> {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn EventSource<O>>,
        cache: Arc<dyn Cache<O>>,
        handler: Arc<dyn ReconcileHandler<O>>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ControllerState::Created);
        Ok(Self {
            queue: WorkQueue::new(config.backoff()),
            config,
            source,
            cache,
            handler,
            faults: Arc::new(LogFaultSink),
            state,
        })
    }

    /// Replace the default logging fault sink.
    pub fn with_fault_sink(mut self, faults: Arc<dyn FaultSink>) -> Self {
        self.faults = faults;
        self
    }

    pub fn queue(&self) -> &WorkQueue<O> {
        &self.queue
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn transition(&self, to: ControllerState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state.send_replace(to);
        info!(%from, %to, "controller state");
        Ok(())
    }

    fn dispatcher(&self) -> Dispatcher<O> {
        Dispatcher::new(
            self.queue.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.handler),
            Arc::clone(&self.faults),
            self.config.max_retries,
        )
    }

    fn synced(&self) -> bool {
        self.source.has_synced() && self.cache.has_synced()
    }

    async fn wait_for_sync(&self) {
        while !self.synced() {
            tokio::time::sleep(self.config.sync_poll_interval).await;
        }
    }

    /// Run until `shutdown` resolves, then drain and stop.
    ///
    /// Fails with [`Error::CacheSync`] if `shutdown` resolves before the
    /// initial listing completes; the controller then never runs a worker.
    /// A controller runs once.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.state() != ControllerState::Created {
            return Err(Error::InvalidTransition {
                from: self.state().to_string(),
                to: ControllerState::Running.to_string(),
            });
        }
        tokio::pin!(shutdown);
        info!(workers = self.config.workers, max_retries = self.config.max_retries, "controller initiating");

        if let Err(e) = self.handler.init().await {
            error!(error = %e, "handler init failed");
            self.transition(ControllerState::Stopped)?;
            return Err(e);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let source = Arc::clone(&self.source);
        let sink: Arc<dyn EventSink<O>> = Arc::new(QueueSink::new(self.queue.clone()));
        let source_task = tokio::spawn(async move {
            if let Err(e) = source.run(sink, stop_rx).await {
                error!(error = %e, "event source failed");
            }
        });

        let synced = tokio::select! {
            _ = &mut shutdown => false,
            _ = self.wait_for_sync() => true,
        };
        if !synced {
            self.faults.report(Fault::CacheSyncFailed);
            self.queue.shut_down();
            stop_tx.send_replace(true);
            if let Err(e) = source_task.await {
                error!(error = %e, "event source task failed");
            }
            self.transition(ControllerState::Stopped)?;
            return Err(Error::CacheSync);
        }
        info!("cache sync complete");

        self.transition(ControllerState::Running)?;
        let dispatcher = self.dispatcher();
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let d = dispatcher.clone();
            workers.spawn(async move { d.run_worker(worker_id).await });
        }
        let mut next_worker_id = self.config.workers;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(joined) = workers.join_next() => {
                    if self.queue.is_shutting_down() {
                        break;
                    }
                    // only a bug outside the handler boundary gets here
                    if let Err(e) = joined {
                        error!(error = %e, "worker exited unexpectedly");
                    }
                    warn!(worker_id = next_worker_id, "restarting worker");
                    let d = dispatcher.clone();
                    let id = next_worker_id;
                    workers.spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        d.run_worker(id).await
                    });
                    next_worker_id += 1;
                }
            }
        }

        self.transition(ControllerState::Draining)?;
        self.queue.shut_down();
        stop_tx.send_replace(true);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker failed during drain");
            }
        }
        self.queue.drain().await;
        if let Err(e) = source_task.await {
            error!(error = %e, "event source task failed");
        }

        self.transition(ControllerState::Stopped)?;
        info!("controller stopped");
        Ok(())
    }
}
