//! Keeps one deployment record per `HttpService`.
//!
//! The registry is the target system: an in-memory store with optimistic
//! concurrency on `resource_version`, so updates follow the usual
//! read-modify-write loop and retry on conflict.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::ReconcileHandler;
use crate::error::{Error, Result};
use crate::model::service::HttpService;
use crate::model::{Key, ObjectMeta, Resource};
use crate::queue::backoff::ExponentialBackoff;

pub const APP_LABEL: &str = "demo";
pub const CONTAINER_NAME: &str = "web";
pub const HTTP_PORT: u16 = 8888;

// ---------------------------------------------------------------------------
// Deployment record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub uid: Uuid,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
    pub container: String,
    pub image: String,
    pub ports: Vec<ContainerPort>,
    pub env: Vec<EnvVar>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Desired deployment for a service. Version, uid and timestamps are
    /// filled in by the registry.
    pub fn for_service(svc: &HttpService) -> Self {
        let now = Utc::now();
        Self {
            metadata: ObjectMeta {
                name: svc.metadata.name.clone(),
                namespace: svc.metadata.namespace.clone(),
                resource_version: 0,
            },
            uid: Uuid::nil(),
            replicas: 1,
            labels: BTreeMap::from([("app".to_string(), APP_LABEL.to_string())]),
            container: CONTAINER_NAME.to_string(),
            image: svc.spec.image.clone(),
            ports: vec![ContainerPort {
                name: "http".to_string(),
                protocol: "TCP".to_string(),
                port: HTTP_PORT,
            }],
            env: access_env(svc.spec.access_mode),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> Key {
        Key::from_meta(&self.metadata)
    }

    /// Whether the mutable part of the deployment matches the service spec.
    pub fn matches(&self, svc: &HttpService) -> bool {
        self.image == svc.spec.image && self.env == access_env(svc.spec.access_mode)
    }

    fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    pub fn get_enabled(&self) -> bool {
        self.env_value("ENABLE_GET") == Some("true")
    }

    pub fn put_enabled(&self) -> bool {
        self.env_value("ENABLE_PUT") == Some("true")
    }
}

/// `ENABLE_GET` / `ENABLE_PUT` for an access mode.
pub fn access_env(access_mode: i32) -> Vec<EnvVar> {
    let (get, put) = match access_mode {
        2 => (false, true),
        3 => (true, true),
        4 => (false, false),
        _ => (true, false),
    };
    vec![
        EnvVar {
            name: "ENABLE_GET".to_string(),
            value: get.to_string(),
        },
        EnvVar {
            name: "ENABLE_PUT".to_string(),
            value: put.to_string(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory deployment store.
#[derive(Default)]
pub struct DeploymentRegistry {
    deployments: RwLock<HashMap<Key, Deployment>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<Deployment> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Create a deployment. Fails with `AlreadyExists` if the key is taken.
    pub fn create(&self, mut deployment: Deployment) -> Result<Deployment> {
        let key = deployment.key();
        let mut deployments = self
            .deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if deployments.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let now = Utc::now();
        deployment.metadata.resource_version = 1;
        deployment.uid = Uuid::new_v4();
        deployment.created_at = now;
        deployment.updated_at = now;
        deployments.insert(key, deployment.clone());
        Ok(deployment)
    }

    /// Write back a deployment previously read from the registry.
    ///
    /// Fails with `Conflict` if someone else wrote it in between.
    pub fn update(&self, mut deployment: Deployment) -> Result<Deployment> {
        let key = deployment.key();
        let mut deployments = self
            .deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = deployments
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(Error::Conflict {
                name: key.to_string(),
                expected: deployment.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }
        deployment.metadata.resource_version = stored.metadata.resource_version + 1;
        deployment.uid = stored.uid;
        deployment.created_at = stored.created_at;
        deployment.updated_at = Utc::now();
        *stored = deployment.clone();
        Ok(deployment)
    }

    pub fn delete(&self, key: &Key) -> Result<Deployment> {
        self.deployments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// All deployments, sorted by key.
    pub fn list(&self) -> Vec<Deployment> {
        let mut all: Vec<Deployment> = self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(Deployment::key);
        all
    }

    pub fn len(&self) -> usize {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Reconciles `HttpService` objects into the deployment registry.
pub struct DeploymentHandler {
    registry: Arc<DeploymentRegistry>,
    conflict_attempts: u32,
    conflict_backoff: ExponentialBackoff,
}

impl DeploymentHandler {
    pub fn new(registry: Arc<DeploymentRegistry>) -> Self {
        Self {
            registry,
            conflict_attempts: 5,
            conflict_backoff: ExponentialBackoff::new(
                Duration::from_millis(10),
                Duration::from_millis(160),
            ),
        }
    }

    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.registry
    }

    /// Bring the deployment at `key` in line with `svc`: read the latest
    /// copy, apply the spec, write it back, and start over on conflict.
    async fn converge(&self, key: &Key, svc: &HttpService) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = match self.registry.get(key) {
                None => {
                    info!(key = %key, "deployment missing, recreating");
                    self.registry.create(Deployment::for_service(svc)).map(|_| ())
                }
                Some(latest) if latest.matches(svc) => return Ok(()),
                Some(mut latest) => {
                    latest.image = svc.spec.image.clone();
                    latest.env = access_env(svc.spec.access_mode);
                    debug!(key = %key, env = ?latest.env, "updating deployment");
                    self.registry.update(latest).map(|_| ())
                }
            };

            match result {
                Err(e) if e.is_conflict() && attempt + 1 < self.conflict_attempts => {
                    let delay = self.conflict_backoff.delay_for(attempt);
                    debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "conflict, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ReconcileHandler<HttpService> for DeploymentHandler {
    async fn init(&self) -> Result<()> {
        info!(existing = self.registry.len(), "deployment handler ready");
        Ok(())
    }

    async fn created(&self, obj: &HttpService) -> Result<()> {
        let key = obj.key();
        match self.registry.get(&key) {
            Some(existing) if existing.matches(obj) => {
                info!(key = %key, version = existing.metadata.resource_version, "deployment already created");
                Ok(())
            }
            Some(_) => {
                info!(key = %key, "deployment exists with stale spec");
                self.converge(&key, obj).await
            }
            None => {
                let created = self.registry.create(Deployment::for_service(obj))?;
                info!(key = %key, uid = %created.uid, image = %created.image, "created deployment");
                Ok(())
            }
        }
    }

    async fn updated(&self, prior: &HttpService, current: &HttpService) -> Result<()> {
        let key = prior.key();
        self.converge(&key, current).await?;
        info!(key = %key, access_mode = current.spec.access_mode, "updated deployment");
        Ok(())
    }

    async fn deleted(&self, prior: &HttpService) -> Result<()> {
        let key = prior.key();
        match self.registry.delete(&key) {
            Ok(_) => {
                info!(key = %key, "deleted deployment");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                info!(key = %key, "deployment already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
