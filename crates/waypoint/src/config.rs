//! Configuration management for the Waypoint server.
//!
//! Loads TOML configuration, fills defaults for missing fields, validates
//! the result, and converts it into the server core's option types.

use lobby_server::{HostConfig, SessionServerOption};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use waypoint_protocol::BufferSize;

fn default_port() -> u16 {
    12345
}

fn default_max_connections() -> usize {
    64
}

fn default_max_channels() -> usize {
    8
}

fn default_service_timeout_ms() -> u32 {
    50
}

fn default_max_sessions() -> u16 {
    16
}

fn default_port_range_start() -> u16 {
    6000
}

fn default_port_range_end() -> u16 {
    6015
}

fn default_queue_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Main server settings
    pub server: ServerSettings,
    /// Session-server fleet settings
    #[serde(default)]
    pub fleet: FleetSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Main server network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Port the main server listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent peers on the main server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Transport channels per host
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Event worker service timeout in milliseconds
    #[serde(default = "default_service_timeout_ms")]
    pub service_timeout_ms: u32,
}

/// Session-server fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Sessions per session-server, doubling as the fleet size cap
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u16,
    /// First port session-servers are provisioned on
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port of the provisioning range
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Transport queue depth
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Incoming bandwidth budget in bytes/s (0 = unlimited)
    #[serde(default)]
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth budget in bytes/s (0 = unlimited)
    #[serde(default)]
    pub outgoing_bandwidth: u32,
    /// Socket buffer preset: "default", "small", "medium", or "large"
    #[serde(default)]
    pub buffer_size: BufferSize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_connections: default_max_connections(),
            max_channels: default_max_channels(),
            service_timeout_ms: default_service_timeout_ms(),
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            queue_size: default_queue_size(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            buffer_size: BufferSize::Default,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            fleet: FleetSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, creating a default file when
    /// none exists yet.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.fleet.port_range_start > self.fleet.port_range_end {
            return Err(format!(
                "fleet port range is inverted: {}..{}",
                self.fleet.port_range_start, self.fleet.port_range_end
            ));
        }

        let range = u32::from(self.fleet.port_range_end) - u32::from(self.fleet.port_range_start) + 1;
        if range < u32::from(self.fleet.max_sessions) {
            return Err(format!(
                "fleet port range holds {range} ports but max_sessions allows {} servers",
                self.fleet.max_sessions
            ));
        }

        let fleet_ports = self.fleet.port_range_start..=self.fleet.port_range_end;
        if fleet_ports.contains(&self.server.port) {
            return Err(format!(
                "main server port {} collides with the fleet port range",
                self.server.port
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            ));
        }

        Ok(())
    }

    /// Fleet options for the session manager.
    pub fn to_session_server_option(&self) -> SessionServerOption {
        SessionServerOption {
            max_connections: self.server.max_connections,
            max_channels: self.server.max_channels,
            max_sessions: self.fleet.max_sessions,
            port_range: (self.fleet.port_range_start, self.fleet.port_range_end),
            queue_size: self.fleet.queue_size,
            incoming_bandwidth: self.fleet.incoming_bandwidth,
            outgoing_bandwidth: self.fleet.outgoing_bandwidth,
            buffer_size: self.fleet.buffer_size,
        }
    }

    /// Host parameters for the main server itself.
    pub fn to_main_host_config(&self) -> HostConfig {
        HostConfig {
            port: self.server.port,
            max_peers: self.server.max_connections,
            max_channels: self.server.max_channels,
            queue_size: self.fleet.queue_size,
            incoming_bandwidth: self.fleet.incoming_bandwidth,
            outgoing_bandwidth: self.fleet.outgoing_bandwidth,
            buffer_size: self.fleet.buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use tokio::fs;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.fleet.max_sessions, 16);
        assert_eq!(config.fleet.port_range_start, 6000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }

    #[tokio::test]
    async fn loading_a_missing_file_creates_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.port, 12345);
        assert!(path.exists());

        // the created file parses back to the same values
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.server.port, config.server.port);
        assert_eq!(reloaded.fleet.max_sessions, config.fleet.max_sessions);
    }

    #[tokio::test]
    async fn loading_an_existing_file_applies_defaults_to_missing_fields() {
        let toml_content = r#"
[server]
port = 20000

[fleet]
max_sessions = 4
port_range_start = 21000
port_range_end = 21010
buffer_size = "medium"

[logging]
level = "debug"
"#;
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.server.port, 20000);
        assert_eq!(config.server.max_connections, 64); // default
        assert_eq!(config.fleet.max_sessions, 4);
        assert_eq!(config.fleet.buffer_size, BufferSize::Medium);
        assert_eq!(config.fleet.queue_size, 1024); // default
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validation_rejects_inverted_port_range() {
        let mut config = AppConfig::default();
        config.fleet.port_range_start = 7000;
        config.fleet.port_range_end = 6000;
        assert!(config.validate().unwrap_err().contains("inverted"));
    }

    #[test]
    fn validation_rejects_a_range_smaller_than_the_fleet_cap() {
        let mut config = AppConfig::default();
        config.fleet.max_sessions = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_main_port_inside_the_fleet_range() {
        let mut config = AppConfig::default();
        config.server.port = 6005;
        assert!(config.validate().unwrap_err().contains("collides"));
    }

    #[test]
    fn validation_rejects_unknown_log_levels() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn conversion_preserves_fleet_limits() {
        let config = AppConfig::default();
        let option = config.to_session_server_option();
        assert_eq!(option.max_sessions, 16);
        assert_eq!(option.port_range, (6000, 6015));

        let host = config.to_main_host_config();
        assert_eq!(host.port, 12345);
        assert_eq!(host.max_peers, 64);
    }
}
