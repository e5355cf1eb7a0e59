//! senso-bridge library crate.
//!
//! Keeps a Senso device reachable from web browsers.  The device speaks raw
//! TCP on two ports; browsers can only speak WebSocket.  This crate holds a
//! persistent, self-healing TCP link to the device and relays its bytes to
//! and from WebSocket clients without interpreting them.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (binary WebSocket messages)
//!         ↕
//! [senso-bridge]
//!   ├── domain/            Pure types: channel roles, connector states, config
//!   ├── application/       Relay errors and read-result classification
//!   └── infrastructure/
//!         ├── ws_server/   WebSocket accept loop and per-client pumps
//!         ├── supervisor/  Handle: the Data/Control queues and sessions
//!         ├── connector/   Dial / retry state machine per device port
//!         └── stream_io/   Socket read and write pumps
//!         ↕
//! Senso device (raw TCP, data port 55568, control port 55567)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no external dependencies (no I/O, no async, no frameworks).
//! - `application` depends on `domain` and `thiserror` only.
//! - `infrastructure` depends on all other layers plus `tokio` and `tungstenite`.
//!
//! # Using the library
//!
//! ```no_run
//! use senso_bridge::domain::ConnectorConfig;
//! use senso_bridge::infrastructure::Handle;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let handle = Handle::new(ConnectorConfig::default(), CancellationToken::new());
//! let session = handle.connect("192.168.1.50");
//!
//! // Waits until the control connector takes the command.
//! handle.control().send(b"command".to_vec()).await;
//! let frame = handle.data().recv().await;
//! println!("device sent {} bytes", frame.len());
//! session.shutdown().await;
//! # }
//! ```

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: relay errors and read classification.
pub mod application;

/// Infrastructure layer: device connectors and the WebSocket server.
pub mod infrastructure;
