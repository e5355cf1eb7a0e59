//! Channel roles, frames and the connector lifecycle states.
//!
//! A Senso device exposes two TCP endpoints on the same host.  The bridge
//! keeps one connection open to each of them:
//!
//! ```text
//! <device>:55568  data     device → bridge  (sensor readings)
//! <device>:55567  control  bridge → device  (commands), replies → bridge
//! ```

use std::fmt;

/// TCP port of the device's data channel.
pub const DATA_PORT: u16 = 55568;

/// TCP port of the device's control channel.
pub const CONTROL_PORT: u16 = 55567;

/// One undivided chunk of bytes: the result of a single socket read, or the
/// payload of a single socket write.
///
/// Frames are opaque.  The bridge never splits, merges or inspects them.
pub type Frame = Vec<u8>;

/// Which of the two device endpoints a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Sensor data stream (device → clients).
    Data,
    /// Command channel (clients → device).
    Control,
}

impl ChannelRole {
    /// Both roles, in the order the supervisor starts them.
    pub const ALL: [ChannelRole; 2] = [ChannelRole::Data, ChannelRole::Control];

    /// Short lowercase name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelRole::Data => "data",
            ChannelRole::Control => "control",
        }
    }

    /// Whether this role accepts frames from clients and writes them to the
    /// device.  Only the control channel does.
    pub fn accepts_commands(self) -> bool {
        matches!(self, ChannelRole::Control)
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single connector.
///
/// ```text
///            ┌──────────── retry interval ────────────┐
///            ▼                                         │
///        Dialing ──ok──► Connected ──link lost──► Retrying
///            │                                         │
///            └──────fail──────────────────────────────►┘
///
///   any state ──cancel──► Cancelled (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// An outbound connection attempt is in progress.
    Dialing,
    /// The socket is up and the multiplexer is relaying frames.
    Connected,
    /// The last attempt failed or the link dropped; waiting to dial again.
    Retrying,
    /// The owning scope was cancelled.  No further socket activity.
    Cancelled,
}

/// Something that happened to a connector, fed into [`ConnectorState::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The dial succeeded.
    DialSucceeded,
    /// The dial failed or timed out.
    DialFailed,
    /// The multiplexer exited because the read side ended or a write failed.
    LinkLost,
    /// The retry interval elapsed.
    RetryElapsed,
    /// The owning cancellation token fired.
    Cancelled,
}

impl ConnectorState {
    /// Returns the state that follows `self` when `event` happens.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    /// `Cancelled` is absorbing.
    pub fn on(self, event: LinkEvent) -> ConnectorState {
        use ConnectorState::*;
        match (self, event) {
            (Cancelled, _) => Cancelled,
            (_, LinkEvent::Cancelled) => Cancelled,
            (Dialing, LinkEvent::DialSucceeded) => Connected,
            (Dialing, LinkEvent::DialFailed) => Retrying,
            (Connected, LinkEvent::LinkLost) => Retrying,
            (Retrying, LinkEvent::RetryElapsed) => Dialing,
            (state, _) => state,
        }
    }

    /// True once the connector has stopped for good.
    pub fn is_terminal(self) -> bool {
        self == ConnectorState::Cancelled
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorState::Dialing => "dialing",
            ConnectorState::Connected => "connected",
            ConnectorState::Retrying => "retrying",
            ConnectorState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
