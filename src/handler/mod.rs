//! Reconcile handlers: the actions that converge a target toward the state
//! of a watched object.

pub mod deployment;

use async_trait::async_trait;

use crate::error::Result;

pub use deployment::{Deployment, DeploymentHandler, DeploymentRegistry};

/// The three reconcile capabilities. Failures are returned, not raised; the
/// dispatcher decides whether to retry.
#[async_trait]
pub trait ReconcileHandler<O>: Send + Sync {
    /// One-time setup before any worker starts.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn created(&self, obj: &O) -> Result<()>;

    /// `prior` is the snapshot from the update event; `current` is the
    /// latest cached state, which may already include later changes.
    async fn updated(&self, prior: &O, current: &O) -> Result<()>;

    async fn deleted(&self, prior: &O) -> Result<()>;
}
