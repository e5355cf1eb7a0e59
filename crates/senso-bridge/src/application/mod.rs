//! Application layer for senso-bridge.
//!
//! Decides *what* happens when a socket or client misbehaves, without doing
//! any I/O itself.
//!
//! # Responsibilities
//!
//! - The [`RelayError`] taxonomy for device and client failures
//! - Classifying read results and errors as transient or fatal
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or listening for connections (that is infrastructure)
//! - Tokio task spawning (that happens in the infrastructure layer)
//! - WebSocket framing (handled by tokio-tungstenite)

pub mod relay;

pub use relay::{classify_read, is_timeout_kind, ReadOutcome, RelayError};
