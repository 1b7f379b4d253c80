//! Configuration types for the scheduler.

use bytesize::ByteSize;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// HTTP and WebSocket listener.
    pub api: ApiConfig,
    /// On-disk locations and cache budget.
    pub storage: StorageConfig,
    /// Worker selection.
    pub dispatch: DispatchConfig,
    /// Per-connection plumbing.
    pub connection: ConnectionConfig,
}

impl SchedulerConfig {
    /// Loads configuration from `kiln.toml`, an optional extra file, then
    /// `KILN_` environment variables (`__` separates nesting levels).
    pub fn load(path: Option<&str>) -> crate::Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("kiln.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        figment
            .merge(Env::prefixed("KILN_").split("__"))
            .extract()
            .map_err(|e| crate::SchedulerError::Config(e.to_string()))
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8097),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding environment archives.
    pub environments_dir: PathBuf,
    /// JSON key-value document (compatibility graph, users).
    pub database_path: PathBuf,
    /// Total archive budget. Eviction is disabled when unset.
    pub max_cache_size: Option<ByteSize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            environments_dir: PathBuf::from("/var/lib/kiln/environments"),
            database_path: PathBuf::from("/var/lib/kiln/db.json"),
            max_cache_size: None,
        }
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on the spare slots credited to any single worker.
    pub max_parallelism: u32,
    /// How long a requester address stays armed after its last dispatch.
    #[serde(rename = "keepalive_window_secs", with = "serde_duration_secs")]
    pub keepalive_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            keepalive_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on each peer's outbound queue.
    pub channel_capacity: usize,
    /// Binary frame size used when pushing archives to workers.
    pub push_chunk_size: ByteSize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            push_chunk_size: ByteSize::kib(256),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.api.listen_addr.port(), 8097);
        assert_eq!(config.dispatch.max_parallelism, 4);
        assert_eq!(config.dispatch.keepalive_window, Duration::from_secs(3600));
        assert!(config.storage.max_cache_size.is_none());
        assert_eq!(config.connection.push_chunk_size.as_u64(), 256 * 1024);
    }

    #[test]
    fn toml_overrides() {
        let config: SchedulerConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [storage]
                max_cache_size = "10 MiB"

                [dispatch]
                keepalive_window_secs = 90
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.storage.max_cache_size, Some(ByteSize::mib(10)));
        assert_eq!(config.dispatch.keepalive_window, Duration::from_secs(90));
        assert_eq!(config.dispatch.max_parallelism, 4);
        assert_eq!(config.api.listen_addr.port(), 8097);
    }

    #[test]
    fn load_tolerates_missing_file() {
        let config = SchedulerConfig::load(Some("/nonexistent/kiln.toml")).unwrap();
        assert_eq!(config.api.listen_addr.port(), 8097);
    }
}
