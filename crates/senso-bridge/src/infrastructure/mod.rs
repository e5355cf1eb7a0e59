//! Infrastructure layer for senso-bridge.
//!
//! The infrastructure layer handles all I/O: dialing the device over TCP,
//! pumping bytes in and out of its sockets, and serving WebSocket clients.
//!
//! # Responsibilities
//!
//! - Dialing the device's data and control ports and redialing on loss
//! - Reading and writing raw frames on the device sockets
//! - Owning the long-lived Data and Control queues
//! - Performing the WebSocket HTTP upgrade handshake
//! - Spawning per-client and per-connection Tokio tasks
//! - Loading the optional TOML config file
//!
//! # What does NOT belong here?
//!
//! - Error classification and read outcomes (that is the application layer)
//! - Channel roles, connector states and settings (that is the domain layer)

pub mod config_file;
pub mod connector;
pub mod fanout;
pub mod queue;
pub mod stream_io;
pub mod supervisor;
pub mod ws_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use config_file::{ConfigError, FileConfig};
pub use queue::FrameQueue;
pub use supervisor::{Handle, SessionGuard};
pub use ws_server::{run_server, serve};
