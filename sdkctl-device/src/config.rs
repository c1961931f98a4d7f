//! Configuration for the mock device service.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Services this device offers.
    pub services: ServicesConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub bind_address: String,
    /// TCP port hosts connect to.
    pub listen_port: u16,
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Service names accepted by the handshake.
    pub names: Vec<String>,
    /// Send `PORT_ENABLED` right after a successful handshake.
    pub enable_on_connect: bool,
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
            bind_address: "127.0.0.1".into(),
            listen_port: sdkctl_core::DEFAULT_PORT,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            names: vec!["sensors".into(), "multi-touch".into()],
            enable_on_connect: true,
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

// ── Loading ──────────────────────────────────────────────────────

impl DeviceConfig {
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
        let text = toml::to_string_pretty(&DeviceConfig::default()).unwrap();
        assert!(text.contains("listen_port"));
        assert!(text.contains("multi-touch"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: DeviceConfig = toml::from_str("[network]\nlisten_port = 5555\n").unwrap();
        assert_eq!(cfg.network.listen_port, 5555);
        assert_eq!(cfg.network.bind_address, "127.0.0.1");
        assert!(cfg.services.enable_on_connect);
        assert_eq!(cfg.services.names.len(), 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = DeviceConfig::load(Path::new("/nonexistent/sdkctl-device.toml"));
        assert_eq!(cfg.network.listen_port, 1970);
    }
}
