//! Senso WebSocket bridge: entry point.
//!
//! This binary keeps a TCP link to a Senso device alive and serves its bytes
//! to browsers over WebSocket.  Frames read from the device go out to
//! clients as binary messages; binary messages from clients are written to
//! the device's control port.
//!
//! # Usage
//!
//! ```text
//! senso-bridge [OPTIONS]
//!
//! Options:
//!   --config          <FILE>  TOML config file
//!   --ws-bind         <IP>    WebSocket bind address [default: 127.0.0.1]
//!   --ws-port         <PORT>  WebSocket listener port [default: 8382]
//!   --ws-path         <PATH>  Only upgrade requests for this path
//!   --device          <HOST>  Device to connect to at startup
//!   --delivery-mode   <MODE>  shared | broadcast [default: shared]
//!   --retry-interval-ms <MS>  Pause between dial attempts [default: 5000]
//!   --read-timeout-ms <MS>    Per-read deadline on device sockets
//!   --log-level       <LVL>   Filter used when RUST_LOG is unset [default: info]
//! ```
//!
//! # Precedence
//!
//! Built-in defaults, then the `--config` file, then flags and environment
//! variables.  Each flag can also be set through the environment:
//!
//! | Variable                   | Flag                  |
//! |----------------------------|-----------------------|
//! | `SENSO_CONFIG`             | `--config`            |
//! | `SENSO_WS_BIND`            | `--ws-bind`           |
//! | `SENSO_WS_PORT`            | `--ws-port`           |
//! | `SENSO_WS_PATH`            | `--ws-path`           |
//! | `SENSO_DEVICE`             | `--device`            |
//! | `SENSO_DELIVERY_MODE`      | `--delivery-mode`     |
//! | `SENSO_RETRY_INTERVAL_MS`  | `--retry-interval-ms` |
//! | `SENSO_READ_TIMEOUT_MS`    | `--read-timeout-ms`   |
//! | `SENSO_LOG_LEVEL`          | `--log-level`         |

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use senso_bridge::domain::{DeliveryMode, GatewayConfig};
use senso_bridge::infrastructure::{run_server, FileConfig, Handle};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Senso WebSocket bridge.
///
/// Keeps the device link alive and relays its frames to browser clients.
#[derive(Debug, Parser)]
#[command(
    name = "senso-bridge",
    about = "WebSocket bridge for the Senso device's TCP data and control channels",
    version
)]
struct Cli {
    /// TOML config file.  Flags override its values.
    #[arg(long, env = "SENSO_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to bind the WebSocket server to.
    ///
    /// Use `0.0.0.0` to accept browsers from the LAN, or `127.0.0.1` for
    /// local clients only.
    #[arg(long, env = "SENSO_WS_BIND")]
    ws_bind: Option<IpAddr>,

    /// TCP port for the WebSocket server to listen on.
    #[arg(long, env = "SENSO_WS_PORT")]
    ws_port: Option<u16>,

    /// Only upgrade requests for this exact path (e.g. `/senso`).
    #[arg(long, env = "SENSO_WS_PATH")]
    ws_path: Option<String>,

    /// Host name or IP of the device to connect to at startup.
    #[arg(long, env = "SENSO_DEVICE")]
    device: Option<String>,

    /// How device frames are shared between clients: `shared` or `broadcast`.
    #[arg(long, env = "SENSO_DELIVERY_MODE")]
    delivery_mode: Option<DeliveryMode>,

    /// Pause between dial attempts, in milliseconds.
    #[arg(long, env = "SENSO_RETRY_INTERVAL_MS")]
    retry_interval_ms: Option<u64>,

    /// Per-read deadline on device sockets, in milliseconds.  0 disables it.
    #[arg(long, env = "SENSO_READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,

    /// `tracing` filter used when `RUST_LOG` is not set.
    #[arg(long, env = "SENSO_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Builds the [`GatewayConfig`] from defaults, the config file and the
    /// flags, in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or holds invalid
    /// values.
    fn into_gateway_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)
                .and_then(FileConfig::into_gateway_config)
                .with_context(|| format!("invalid config file '{}'", path.display()))?,
            None => GatewayConfig::default(),
        };

        if let Some(ip) = self.ws_bind {
            config.ws_bind_addr.set_ip(ip);
        }
        if let Some(port) = self.ws_port {
            config.ws_bind_addr.set_port(port);
        }
        if let Some(path) = self.ws_path {
            config.ws_path = Some(path);
        }
        if let Some(device) = self.device {
            config.device_address = Some(device);
        }
        if let Some(mode) = self.delivery_mode {
            config.delivery_mode = mode;
        }
        if let Some(ms) = self.retry_interval_ms {
            config.connector.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.read_timeout_ms {
            config.connector.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments (and the optional config file) are turned into a
///    [`GatewayConfig`].
/// 2. `tracing_subscriber` is initialised.  `RUST_LOG` wins; otherwise the
///    configured log level applies.
/// 3. A root [`CancellationToken`] is created and cancelled on Ctrl+C.
/// 4. A [`Handle`] is created and, if a device is configured, a session to
///    it is started.
/// 5. [`run_server`] serves WebSocket clients until the token fires.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_gateway_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        ws = %config.ws_bind_addr,
        device = config.device_address.as_deref().unwrap_or("-"),
        mode = ?config.delivery_mode,
        "Senso WebSocket bridge starting"
    );

    // ── Graceful shutdown ─────────────────────────────────────────────────────
    let root = CancellationToken::new();
    let shutdown = root.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Device link ───────────────────────────────────────────────────────────
    let handle = Handle::new(config.connector.clone(), root.clone());
    let session = config
        .device_address
        .as_deref()
        .map(|address| handle.connect(address));

    // ── Main server loop ──────────────────────────────────────────────────────
    let served = run_server(&config, &handle, root.clone()).await;

    root.cancel();
    if let Some(session) = session {
        session.shutdown().await;
    }
    served?;

    info!("Senso WebSocket bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["senso-bridge"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_no_flags_give_default_config() {
        // Arrange
        let cli = Cli {
            config: None,
            ws_bind: None,
            ws_port: None,
            ws_path: None,
            device: None,
            delivery_mode: None,
            retry_interval_ms: None,
            read_timeout_ms: None,
            log_level: None,
        };

        // Act
        let config = cli.into_gateway_config().unwrap();

        // Assert
        assert_eq!(config.ws_bind_addr.to_string(), "127.0.0.1:8382");
        assert_eq!(config.device_address, None);
        assert_eq!(config.delivery_mode, DeliveryMode::Shared);
        assert_eq!(config.connector.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_ws_bind_and_port_override() {
        let config = cli(&["--ws-bind", "0.0.0.0", "--ws-port", "9999"])
            .into_gateway_config()
            .unwrap();
        assert_eq!(config.ws_bind_addr.to_string(), "0.0.0.0:9999");
    }

    #[test]
    fn test_device_and_path_override() {
        let config = cli(&["--device", "10.0.0.5", "--ws-path", "/senso"])
            .into_gateway_config()
            .unwrap();
        assert_eq!(config.device_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.ws_path.as_deref(), Some("/senso"));
    }

    #[test]
    fn test_delivery_mode_flag() {
        let config = cli(&["--delivery-mode", "broadcast"])
            .into_gateway_config()
            .unwrap();
        assert_eq!(config.delivery_mode, DeliveryMode::Broadcast);
    }

    #[test]
    fn test_invalid_delivery_mode_is_rejected() {
        let result = Cli::try_parse_from(["senso-bridge", "--delivery-mode", "roundrobin"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_ws_bind_is_rejected() {
        let result = Cli::try_parse_from(["senso-bridge", "--ws-bind", "not.an.ip"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_timing_overrides() {
        let config = cli(&["--retry-interval-ms", "250", "--read-timeout-ms", "100"])
            .into_gateway_config()
            .unwrap();
        assert_eq!(config.connector.retry_interval, Duration::from_millis(250));
        assert_eq!(config.connector.read_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_read_timeout_disables_it() {
        let config = cli(&["--read-timeout-ms", "0"]).into_gateway_config().unwrap();
        assert_eq!(config.connector.read_timeout, None);
    }

    #[test]
    fn test_flags_override_config_file() {
        // Arrange: a config file that sets the port and the device
        let path = std::env::temp_dir().join(format!("senso-bridge-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[server]\nbind = \"0.0.0.0:7000\"\n[device]\naddress = \"10.0.0.1\"\n",
        )
        .unwrap();

        // Act: the flag overrides the device, the file keeps the bind address
        let path_arg = path.to_string_lossy().into_owned();
        let config = cli(&["--config", &path_arg, "--device", "10.0.0.2"])
            .into_gateway_config();
        std::fs::remove_file(&path).ok();
        let config = config.unwrap();

        // Assert
        assert_eq!(config.ws_bind_addr.to_string(), "0.0.0.0:7000");
        assert_eq!(config.device_address.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = cli(&["--config", "/nonexistent/senso.toml"]).into_gateway_config();
        assert!(result.is_err());
    }
}
