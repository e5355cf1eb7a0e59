//! Relay error taxonomy and the decisions that hang off it.
//!
//! Every failure the relay can hit on a device socket or a WebSocket client
//! is one [`RelayError`] variant.  The connector and the pumps never inspect
//! raw I/O errors themselves; they ask this module whether an error is
//! transient (keep going) or ends the current connection.
//!
//! ```text
//! Dial / DialTimeout      retry after the fixed interval
//! read deadline elapsed   not an error: ReadOutcome::Retry
//! ReadFailed / Eof        end the connection, reconnect
//! WriteTimeout            log, keep the connection
//! WriteFailed             end the connection, reconnect (unless timeout-kind)
//! NotConnected            end the connection, reconnect
//! Upgrade                 answer 400 to that client
//! UnexpectedClose         end that client's pumps
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

// ── Error type ────────────────────────────────────────────────────────────────

/// Errors raised while relaying frames between the device and clients.
///
/// None of these stop the process.  They are logged and contained by the
/// connector or pump that hit them.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The outbound connection attempt was refused or could not be routed.
    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The outbound connection attempt did not finish in time.
    #[error("dial {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    /// A socket read failed for a reason other than a timeout.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// The device closed the connection.
    #[error("connection closed by peer")]
    Eof,

    /// Writing one frame took longer than the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Writing one frame failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// The writer was asked to write without a socket.
    #[error("not connected, can not write to TCP connection")]
    NotConnected,

    /// The HTTP request could not be upgraded to a WebSocket.
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),

    /// A WebSocket client went away without a normal close.
    #[error("unexpected WebSocket close: {0}")]
    UnexpectedClose(String),
}

impl RelayError {
    /// Returns true if the current connection survives this error.
    ///
    /// Write timeouts are transient.  A write that failed with a
    /// timeout-kind I/O error counts as a timeout too.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::WriteTimeout(_) => true,
            RelayError::WriteFailed(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }

    /// Returns true for dial failures, which lead to another attempt after
    /// the retry interval rather than to a torn-down connection.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, RelayError::Dial { .. } | RelayError::DialTimeout { .. })
    }
}

/// I/O error kinds that mean "no progress before the deadline" rather than a
/// broken socket.
pub fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

// ── Read classification ───────────────────────────────────────────────────────

/// What the reader should do with the result of one `read()` call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes arrived; forward them.
    Data(usize),
    /// Nothing arrived but the socket is fine; read again.
    Retry,
    /// The stream is over; stop reading.
    Finished(RelayError),
}

/// Maps the result of a single socket read to a [`ReadOutcome`].
///
/// A read of zero bytes into a non-empty buffer is end-of-stream.
pub fn classify_read(result: io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Finished(RelayError::Eof),
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
        Err(e) if is_timeout_kind(e.kind()) => ReadOutcome::Retry,
        Err(e) => ReadOutcome::Finished(RelayError::ReadFailed(e)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
