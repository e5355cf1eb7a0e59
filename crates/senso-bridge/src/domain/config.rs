//! Gateway configuration types.
//!
//! [`GatewayConfig`] is the single source of truth for all runtime settings.
//! It is a plain struct: no global state and no environment reads.  The
//! binary fills it from defaults, an optional TOML file and CLI flags.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use super::channel::{ChannelRole, CONTROL_PORT, DATA_PORT};

/// Size of the per-read buffer on device sockets, and of the WebSocket write
/// buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// How frames from the Data queue reach WebSocket clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// All clients consume from the one Data queue.  Each frame goes to
    /// exactly one client, whichever is ready first.
    #[default]
    Shared,
    /// A fan-out task copies every frame into one bounded queue per client.
    /// A client whose queue is full misses that frame.
    Broadcast,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(DeliveryMode::Shared),
            "broadcast" => Ok(DeliveryMode::Broadcast),
            other => Err(format!(
                "unknown delivery mode '{other}' (expected 'shared' or 'broadcast')"
            )),
        }
    }
}

/// Which `Origin` headers the WebSocket upgrade accepts.
///
/// The bridge is meant for a trusted local network, so the only policy is to
/// accept every origin.  It is spelled out as a type so the decision is
/// visible wherever the upgrade happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginPolicy {
    /// Accept any origin, including none.
    #[default]
    AllowAny,
}

impl OriginPolicy {
    /// Returns true if a request carrying `origin` may be upgraded.
    pub fn allows(self, _origin: Option<&str>) -> bool {
        match self {
            OriginPolicy::AllowAny => true,
        }
    }
}

/// Timing and port settings for the device connectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Port of the data channel on the device.
    pub data_port: u16,
    /// Port of the control channel on the device.
    pub control_port: u16,
    /// Upper bound on a single dial attempt.
    pub dial_timeout: Duration,
    /// Pause between a failed attempt (or a dropped link) and the next dial.
    pub retry_interval: Duration,
    /// Deadline for writing one frame to a device socket.
    pub write_timeout: Duration,
    /// Optional deadline for a single socket read.  An expired read is not an
    /// error; the reader simply reads again.  `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Size of the read buffer, and therefore the largest frame a read yields.
    pub read_buffer_size: usize,
}

impl ConnectorConfig {
    /// Port for the given channel role.
    pub fn port(&self, role: ChannelRole) -> u16 {
        match role {
            ChannelRole::Data => self.data_port,
            ChannelRole::Control => self.control_port,
        }
    }
}

impl Default for ConnectorConfig {
    /// | Field            | Default  |
    /// |------------------|----------|
    /// | data_port        | 55568    |
    /// | control_port     | 55567    |
    /// | dial_timeout     | 1 s      |
    /// | retry_interval   | 5 s      |
    /// | write_timeout    | 50 ms    |
    /// | read_timeout     | none     |
    /// | read_buffer_size | 1024     |
    fn default() -> Self {
        Self {
            data_port: DATA_PORT,
            control_port: CONTROL_PORT,
            dial_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
            write_timeout: Duration::from_millis(50),
            read_timeout: None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// All runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to.
    pub ws_bind_addr: SocketAddr,
    /// If set, only upgrade requests for this exact path are accepted.
    /// `None` upgrades every request regardless of path.
    pub ws_path: Option<String>,
    /// Device host to connect to at startup, if any.
    pub device_address: Option<String>,
    /// Device connector settings.
    pub connector: ConnectorConfig,
    /// Deadline for sending one WebSocket message to a client.
    pub ws_write_timeout: Duration,
    /// WebSocket write buffer size in bytes.
    pub ws_buffer_size: usize,
    /// How Data frames are distributed across clients.
    pub delivery_mode: DeliveryMode,
    /// Origin acceptance policy for upgrades.
    pub origin_policy: OriginPolicy,
    /// Fallback `tracing` filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([127, 0, 0, 1], 8382)),
            ws_path: None,
            device_address: None,
            connector: ConnectorConfig::default(),
            ws_write_timeout: Duration::from_millis(50),
            ws_buffer_size: DEFAULT_BUFFER_SIZE,
            delivery_mode: DeliveryMode::default(),
            origin_policy: OriginPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
