//! Configuration for the host client.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Connection settings.
    pub network: NetworkConfig,
    /// The service to claim and how to talk to it.
    pub service: ServiceConfig,
    /// Buffer recycling.
    pub recycler: RecyclerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Loopback port of the SDK controller service.
    pub port: u16,
    /// Delay between connect attempts until the first connection (ms).
    pub retry_timeout_ms: u64,
    /// Delay before reconnecting a lost session (ms).
    pub reconnect_timeout_ms: u64,
}

/// Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name sent in the handshake query.
    pub name: String,
    /// How long a query waits for its reply (ms).
    pub query_timeout_ms: u64,
    /// Query type used for `--query`.
    pub query_type: i32,
}

/// Recycler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclerConfig {
    /// Largest payload served from the pool (bytes).
    pub data_size: usize,
    /// Spare blocks kept for reuse.
    pub max_blocks: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: sdkctl_core::DEFAULT_PORT,
            retry_timeout_ms: 500,
            reconnect_timeout_ms: 2000,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "sensors".into(),
            query_timeout_ms: 3000,
            query_type: 1,
        }
    }
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self {
            data_size: 512,
            max_blocks: 32,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────

impl NetworkConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

impl ServiceConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        assert!(text.contains("reconnect_timeout_ms"));
        assert!(text.contains("sensors"));
    }

    #[test]
    fn config_roundtrip() {
        let mut cfg = HostConfig::default();
        cfg.service.name = "multi-touch".into();
        cfg.recycler.max_blocks = 4;
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: HostConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.service.name, "multi-touch");
        assert_eq!(back.recycler.max_blocks, 4);
        assert_eq!(back.network.port, 1970);
    }

    #[test]
    fn durations_come_from_millis() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.network.retry_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.network.reconnect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.service.query_timeout(), Duration::from_secs(3));
    }
}
