//! statesync.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Route name the dispatcher consumes from.
pub const SYNC_ROUTE: &str = "processor/state/sync";
/// Route name forwarded updates are published to.
pub const FORWARD_ROUTE: &str = "processor/state/router";
/// Route name for failure telemetry.
pub const MONITOR_ROUTE: &str = "processor/monitor";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub messaging: MessagingConfig,
    /// Route name → destination subjects.
    pub routes: HashMap<String, Vec<String>>,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub consumer: ConsumerConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub sync_route: String,
    pub forward_route: String,
    pub monitor_route: String,
    pub queue_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            sync_route: SYNC_ROUTE.to_string(),
            forward_route: FORWARD_ROUTE.to_string(),
            monitor_route: MONITOR_ROUTE.to_string(),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Load states without their row body.
    pub lightweight: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("statesync.redb"),
            lightweight: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub freshness_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { freshness_secs: 30 }
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub concurrency: usize,
    pub max_redeliveries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_redeliveries: 5,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Address for newline-delimited JSON ingest. Disabled when unset.
    pub listen: Option<SocketAddr>,
    /// Longest accepted line. Longer lines are discarded.
    pub max_line_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Destinations registered for a route name.
    pub fn destinations(&self, route_name: &str) -> &[String] {
        self.routes
            .get(route_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "consumer.concurrency must be at least 1".to_string(),
            ));
        }
        if self.cache.freshness_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.freshness_secs must be at least 1".to_string(),
            ));
        }
        if self.ingest.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "ingest.max_line_bytes must be at least 1".to_string(),
            ));
        }
        if self.destinations(&self.messaging.sync_route).is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no destinations configured for sync route {}",
                self.messaging.sync_route
            )));
        }
        Ok(())
    }

    /// A single-node configuration. Forwarded updates and monitor events go
    /// to their own subjects for downstream processors to pick up.
    pub fn scaffold(path: &Path) -> Self {
        let mut routes = HashMap::new();
        routes.insert(SYNC_ROUTE.to_string(), vec!["state.sync".to_string()]);
        routes.insert(FORWARD_ROUTE.to_string(), vec!["state.router".to_string()]);
        routes.insert(MONITOR_ROUTE.to_string(), vec!["state.monitor".to_string()]);
        SyncConfig {
            routes,
            storage: StorageConfig {
                path: path.to_path_buf(),
                lightweight: true,
            },
            ..Default::default()
        }
    }
}
