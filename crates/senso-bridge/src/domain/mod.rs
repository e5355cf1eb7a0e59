//! Domain layer for senso-bridge.
//!
//! Pure types with no I/O: channel roles, frames, the connector state
//! machine and the gateway configuration.  Nothing here touches sockets,
//! tasks or the filesystem.

pub mod channel;
pub mod config;

pub use channel::{ChannelRole, ConnectorState, Frame, LinkEvent, CONTROL_PORT, DATA_PORT};
pub use config::{ConnectorConfig, DeliveryMode, GatewayConfig, OriginPolicy, DEFAULT_BUFFER_SIZE};
