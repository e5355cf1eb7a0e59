//! TOML configuration file for the gateway binary.
//!
//! Every key is optional.  Missing keys take the same defaults as
//! [`GatewayConfig::default`], so an empty file is a valid configuration.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8382"
//! path = "/senso"
//! delivery_mode = "broadcast"
//! log_level = "debug"
//! write_timeout_ms = 50
//! buffer_size = 1024
//!
//! [device]
//! address = "192.168.1.50"
//! data_port = 55568
//! control_port = 55567
//! dial_timeout_ms = 1000
//! retry_interval_ms = 5000
//! write_timeout_ms = 50
//! read_timeout_ms = 250
//! read_buffer_size = 1024
//! ```
//!
//! Values given on the command line win over values from the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ConnectorConfig, DeliveryMode, GatewayConfig, CONTROL_PORT, DATA_PORT, DEFAULT_BUFFER_SIZE,
};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The TOML parsed but a value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level layout of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub device: DeviceSection,
}

/// `[server]`: the WebSocket side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Listen address, e.g. `"0.0.0.0:8382"`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Optional upgrade path filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// `"shared"` or `"broadcast"`.
    #[serde(default = "default_delivery_mode")]
    pub delivery_mode: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// `[device]`: the TCP side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    /// Device host to connect to at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Omit (or set to 0) to wait on reads indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind() -> String {
    "127.0.0.1:8382".to_string()
}
fn default_delivery_mode() -> String {
    "shared".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_write_timeout_ms() -> u64 {
    50
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_data_port() -> u16 {
    DATA_PORT
}
fn default_control_port() -> u16 {
    CONTROL_PORT
}
fn default_dial_timeout_ms() -> u64 {
    1_000
}
fn default_retry_interval_ms() -> u64 {
    5_000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: None,
            delivery_mode: default_delivery_mode(),
            log_level: default_log_level(),
            write_timeout_ms: default_write_timeout_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            address: None,
            data_port: default_data_port(),
            control_port: default_control_port(),
            dial_timeout_ms: default_dial_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: None,
            read_buffer_size: default_buffer_size(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FileConfig {
    /// Parses config file content.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed or names an
    /// unknown key.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read (a missing file
    /// is an error here: the path was asked for explicitly), and
    /// [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Converts the file values into a full [`GatewayConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable bind address or
    /// delivery mode, a zero port, a zero buffer size, or a zero timeout.
    pub fn into_gateway_config(self) -> Result<GatewayConfig, ConfigError> {
        let server = self.server;
        let device = self.device;

        let ws_bind_addr: SocketAddr = server.bind.parse().map_err(|e| {
            ConfigError::Invalid(format!("server.bind '{}': {e}", server.bind))
        })?;
        let delivery_mode: DeliveryMode = server
            .delivery_mode
            .parse()
            .map_err(|e: String| ConfigError::Invalid(format!("server.delivery_mode: {e}")))?;

        if device.data_port == 0 || device.control_port == 0 {
            return Err(ConfigError::Invalid("device ports must be non-zero".into()));
        }
        if server.buffer_size == 0 || device.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        for (key, value) in [
            ("server.write_timeout_ms", server.write_timeout_ms),
            ("device.dial_timeout_ms", device.dial_timeout_ms),
            ("device.write_timeout_ms", device.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be non-zero")));
            }
        }

        Ok(GatewayConfig {
            ws_bind_addr,
            ws_path: server.path,
            device_address: device.address,
            connector: ConnectorConfig {
                data_port: device.data_port,
                control_port: device.control_port,
                dial_timeout: Duration::from_millis(device.dial_timeout_ms),
                retry_interval: Duration::from_millis(device.retry_interval_ms),
                write_timeout: Duration::from_millis(device.write_timeout_ms),
                read_timeout: device
                    .read_timeout_ms
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis),
                read_buffer_size: device.read_buffer_size,
            },
            ws_write_timeout: Duration::from_millis(server.write_timeout_ms),
            ws_buffer_size: server.buffer_size,
            delivery_mode,
            log_level: server.log_level,
            ..GatewayConfig::default()
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
