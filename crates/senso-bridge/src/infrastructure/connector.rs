//! Persistent TCP connection to one device endpoint.
//!
//! A [`Connector`] owns the reconnect state machine for one channel role.
//! It dials, relays frames while connected, and dials again after a fixed
//! pause whenever the link drops, until its cancellation token fires.
//!
//! While connected, a single multiplexer loop ties the socket pumps to the
//! session queues:
//!
//! ```text
//!                      ┌───────────── connector ─────────────┐
//! socket ─► reader ─► read queue ─► offer ─► session Data queue
//! socket ◄─ writer ◄─ write queue ◄─ send ◄─ session Control queue (control only)
//!              └─► error queue ─► timeout: keep going / other: reconnect
//! ```
//!
//! Device frames are offered without waiting: if no consumer is ready the
//! frame is dropped, so a slow or absent client never stalls the socket.
//! Commands are forwarded with an awaited send, so they are never dropped
//! while the connection is up and always reach the socket in order.
//!
//! Every connector offers what it reads to the Data queue, the control
//! connector included: device replies on the control socket go out to
//! WebSocket clients alongside data frames.  This is intended.  Only the
//! control connector consumes the Control queue.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::application::RelayError;
use crate::domain::{ChannelRole, ConnectorConfig, ConnectorState, Frame, LinkEvent};
use crate::infrastructure::queue::FrameQueue;
use crate::infrastructure::stream_io::{run_reader, run_writer};

/// Depth of the socket-local queues between the pumps and the multiplexer.
const LINK_QUEUE_DEPTH: usize = 1;

/// Why the multiplexer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxExit {
    Cancelled,
    ReadClosed,
    WriteFailed,
}

/// One device endpoint with its dial-retry state machine.
pub struct Connector {
    role: ChannelRole,
    address: String,
    config: ConnectorConfig,
    /// Where frames read from the socket go.
    upstream: FrameQueue,
    /// Where frames to write to the socket come from (control role only).
    inbound: Option<FrameQueue>,
    state_tx: watch::Sender<ConnectorState>,
}

impl Connector {
    /// Creates a connector for `role` on `host`.
    ///
    /// Frames read from the socket are offered to `data`.  If the role
    /// accepts commands, frames taken from `control` are written to the
    /// socket.
    ///
    /// Returns the connector together with a watcher of its state.
    pub fn new(
        role: ChannelRole,
        host: &str,
        config: ConnectorConfig,
        data: FrameQueue,
        control: FrameQueue,
    ) -> (Self, watch::Receiver<ConnectorState>) {
        let address = format!("{host}:{}", config.port(role));
        let (state_tx, state_rx) = watch::channel(ConnectorState::Dialing);
        let inbound = role.accepts_commands().then_some(control);
        let connector = Self {
            role,
            address,
            config,
            upstream: data,
            inbound,
            state_tx,
        };
        (connector, state_rx)
    }

    /// The `host:port` this connector dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The channel role this connector serves.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Runs the state machine until `cancel` fires.
    ///
    /// Never returns on its own: dial failures and dropped links lead to
    /// another attempt after `retry_interval`.
    pub async fn run(self, cancel: CancellationToken) {
        let mut state = ConnectorState::Dialing;
        let mut stream: Option<TcpStream> = None;

        loop {
            self.state_tx.send_replace(state);
            if state.is_terminal() {
                break;
            }

            let event = match state {
                ConnectorState::Dialing => match self.dial(&cancel).await {
                    None => LinkEvent::Cancelled,
                    Some(Ok(connected)) => {
                        info!("connected");
                        stream = Some(connected);
                        LinkEvent::DialSucceeded
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "dial failed");
                        LinkEvent::DialFailed
                    }
                },
                ConnectorState::Connected => {
                    let exit = match stream.take() {
                        Some(connected) => self.run_connection(connected, &cancel).await,
                        None => MuxExit::ReadClosed,
                    };
                    if exit == MuxExit::Cancelled || cancel.is_cancelled() {
                        LinkEvent::Cancelled
                    } else {
                        LinkEvent::LinkLost
                    }
                }
                ConnectorState::Retrying => {
                    debug!(retry_in = ?self.config.retry_interval, "waiting before next dial");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => LinkEvent::Cancelled,
                        _ = sleep(self.config.retry_interval) => LinkEvent::RetryElapsed,
                    }
                }
                ConnectorState::Cancelled => LinkEvent::Cancelled,
            };

            state = state.on(event);
        }

        info!("connector stopped");
    }

    /// One dial attempt bounded by `dial_timeout`.
    ///
    /// Returns `None` if cancelled while dialing.
    async fn dial(&self, cancel: &CancellationToken) -> Option<Result<TcpStream, RelayError>> {
        if cancel.is_cancelled() {
            return None;
        }
        info!("dialing");
        let attempt = timeout(self.config.dial_timeout, TcpStream::connect(&self.address));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempt => Some(match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(source)) => Err(RelayError::Dial {
                    address: self.address.clone(),
                    source,
                }),
                Err(_) => Err(RelayError::DialTimeout {
                    address: self.address.clone(),
                    timeout: self.config.dial_timeout,
                }),
            }),
        }
    }

    /// Drives one live connection until it ends, then tears it down.
    ///
    /// The socket halves are moved into the reader and writer tasks.  Both
    /// tasks are cancelled and joined before this returns, so the socket is
    /// closed exactly once and nothing from this connection outlives it.
    async fn run_connection(&self, stream: TcpStream, cancel: &CancellationToken) -> MuxExit {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set TCP_NODELAY failed");
        }

        let link_cancel = cancel.child_token();
        let (read_half, write_half) = stream.into_split();

        let (read_tx, mut read_rx) = mpsc::channel::<Frame>(LINK_QUEUE_DEPTH);
        let (write_tx, write_rx) = mpsc::channel::<Frame>(LINK_QUEUE_DEPTH);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<RelayError>();

        let reader = tokio::spawn(
            run_reader(
                read_half,
                read_tx,
                self.config.read_buffer_size,
                self.config.read_timeout,
                link_cancel.clone(),
            )
            .in_current_span(),
        );
        let writer = tokio::spawn(
            run_writer(
                Some(write_half),
                write_rx,
                error_tx,
                self.config.write_timeout,
                link_cancel.clone(),
            )
            .in_current_span(),
        );

        let exit = self
            .multiplex(&mut read_rx, write_tx, &mut error_rx, cancel)
            .await;
        debug!(?exit, "multiplexer exited");

        link_cancel.cancel();
        for (name, task) in [("reader", reader), ("writer", writer)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "socket task panicked");
            }
        }
        info!("disconnected");

        exit
    }

    /// The select loop relaying frames while connected.
    ///
    /// `write_tx` is taken by value: returning drops it, which closes the
    /// writer's input queue.
    async fn multiplex(
        &self,
        read_rx: &mut mpsc::Receiver<Frame>,
        write_tx: mpsc::Sender<Frame>,
        error_rx: &mut mpsc::UnboundedReceiver<RelayError>,
        cancel: &CancellationToken,
    ) -> MuxExit {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MuxExit::Cancelled,

                frame = read_rx.recv() => match frame {
                    Some(frame) => {
                        let len = frame.len();
                        if !self.upstream.offer(frame) {
                            debug!(bytes = len, "no receiver ready; frame dropped");
                        }
                    }
                    None => return MuxExit::ReadClosed,
                },

                Some(frame) = next_command(self.inbound.as_ref()) => {
                    // Commands wait for the writer rather than being dropped.
                    tokio::select! {
                        _ = cancel.cancelled() => return MuxExit::Cancelled,
                        sent = write_tx.send(frame) => {
                            if sent.is_err() {
                                warn!("writer gone; command not delivered");
                                return MuxExit::WriteFailed;
                            }
                        }
                    }
                }

                Some(e) = error_rx.recv() => {
                    if e.is_transient() {
                        debug!(error = %e, "write timeout");
                    } else {
                        error!(error = %e, "write error");
                        return MuxExit::WriteFailed;
                    }
                }
            }
        }
    }
}

/// Next command for the socket, or never if this role takes no commands.
async fn next_command(inbound: Option<&FrameQueue>) -> Option<Frame> {
    match inbound {
        Some(queue) => Some(queue.recv().await),
        None => std::future::pending().await,
    }
}

/// Spawns `connector` on the runtime inside its own tracing span.
pub fn spawn_connector(
    connector: Connector,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::info_span!(
        "connector",
        channel = %connector.role(),
        address = %connector.address()
    );
    tokio::spawn(connector.run(cancel).instrument(span))
}

/// Waits until `state` reports `wanted`, or `limit` elapses.
///
/// Returns true if the state was reached.
pub async fn wait_for_state(
    state: &mut watch::Receiver<ConnectorState>,
    wanted: ConnectorState,
    limit: Duration,
) -> bool {
    timeout(limit, state.wait_for(|s| *s == wanted))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
