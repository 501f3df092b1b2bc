// tallystream-config - Unified configuration
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from TALLYSTREAM_CONFIG env var
// 3. Config file contents from TALLYSTREAM_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.tallystream.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod sources;
mod validation;

pub use sources::{load_config, load_from_file_path};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Listener and process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Name this node registers under in the `servers` status hash.
    pub server_name: String,
    pub worker_count: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Crash-recovery dump file for unflushed pending state.
    pub dump_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:24224".to_string(),
            server_name: default_server_name(),
            worker_count: 1,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            dump_path: "./tallystream-dump.json".to_string(),
        }
    }
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "tallystream".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unsupported log format: {}. Supported: text, json", s),
        }
    }
}

/// Wire ingestion limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Unterminated per-connection buffers above this are dropped and
    /// the connection closed.
    pub max_buffer_bytes: usize,
    /// Buffers idle longer than this are evicted by housekeeping.
    pub buffer_idle_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 10_000_000,
            buffer_idle_secs: 180,
        }
    }
}

/// Flush cadence and locking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Interval between flush cycles.
    pub merge_interval_ms: u64,
    /// Offset each worker's first flush by its id to spread store load.
    pub stagger_workers: bool,
    /// A held lock older than this is considered abandoned and reclaimed.
    pub lock_stale_secs: u64,
    /// Upper bound on one flush cycle's lock retries.
    pub cycle_deadline_ms: u64,
    /// Run one final flush before dumping state at shutdown.
    pub flush_at_shutdown: bool,
    /// Days of per-job counter hashes to keep.
    pub counter_retention_days: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            merge_interval_ms: 3_000,
            stagger_workers: true,
            lock_stale_secs: 10,
            cycle_deadline_ms: 5_000,
            flush_at_shutdown: false,
            counter_retention_days: 10,
        }
    }
}

impl FlushConfig {
    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }
}

/// Store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// How often a worker without a live store handle retries connecting.
    pub reconnect_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            reconnect_interval_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let config = RuntimeConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:24224");
        assert_eq!(config.ingest.max_buffer_bytes, 10_000_000);
        assert_eq!(config.flush.merge_interval_ms, 3_000);
        assert_eq!(config.flush.lock_stale_secs, 10);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        config.validate().unwrap();
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"
            server_name = "node-a"
            worker_count = 4
            log_level = "debug"
            log_format = "json"
            dump_path = "/tmp/dump.json"

            [flush]
            merge_interval_ms = 1000
            lock_stale_secs = 5
            cycle_deadline_ms = 2000
            counter_retention_days = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.server.worker_count, 4);
        assert_eq!(config.flush.merge_interval_ms, 1000);
        assert!(config.flush.stagger_workers);
        // Untouched sections keep their defaults.
        assert_eq!(config.ingest.buffer_idle_secs, 180);
        assert_eq!(config.store.reconnect_interval_secs, 3);
    }
}
