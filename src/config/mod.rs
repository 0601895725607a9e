//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast if a numeric var does not parse or
//! the controller settings are out of range. CLI flags override fields.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::ControllerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of `*.toml` resource manifests to watch. The CLI flag
    /// takes precedence; one of the two must be given.
    pub resource_dir: Option<PathBuf>,
    /// How often the manifest directory is re-listed.
    pub poll_interval: Duration,
    pub controller: ControllerConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = ControllerConfig::default();
        let controller = ControllerConfig {
            workers: optional_var("RECONCILE_WORKERS")?.unwrap_or(defaults.workers),
            max_retries: optional_var("RECONCILE_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            backoff_base: optional_var("RECONCILE_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: optional_var("RECONCILE_BACKOFF_CAP_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            sync_poll_interval: defaults.sync_poll_interval,
        };
        let config = Self {
            resource_dir: std::env::var("RECONCILE_RESOURCE_DIR").ok().map(PathBuf::from),
            poll_interval: optional_var("RECONCILE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1)),
            controller,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges. Call again after applying CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        self.controller.validate()
    }
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
