//! Frame sources for WebSocket clients, and the broadcast fan-out.
//!
//! In [`DeliveryMode::Shared`](crate::domain::DeliveryMode::Shared) every
//! client reads straight from the session Data queue, so concurrent clients
//! split the stream between them.
//!
//! In [`DeliveryMode::Broadcast`](crate::domain::DeliveryMode::Broadcast) a
//! single [`Broadcaster`] task owns the consuming side of the Data queue and
//! copies each frame into one bounded queue per client.  A client whose queue
//! is full misses that frame; the other clients are unaffected.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::domain::Frame;
use crate::infrastructure::queue::FrameQueue;

/// Depth of each client's queue in broadcast mode.
pub const CLIENT_QUEUE_DEPTH: usize = 16;

/// Where an outbound pump takes its frames from.
#[derive(Debug)]
pub enum FrameSource {
    /// Competes with other clients for frames on the shared Data queue.
    Shared(FrameQueue),
    /// Receives its own copy of every frame from a [`Broadcaster`].
    Dedicated(mpsc::Receiver<Frame>),
}

impl FrameSource {
    /// Waits for the next frame for this client.
    ///
    /// Cancel-safe in both variants.
    pub async fn next(&mut self) -> Option<Frame> {
        match self {
            FrameSource::Shared(queue) => Some(queue.recv().await),
            FrameSource::Dedicated(rx) => rx.recv().await,
        }
    }
}

/// Handle to the fan-out task.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    register_tx: mpsc::Sender<mpsc::Sender<Frame>>,
}

impl Broadcaster {
    /// Spawns the fan-out task consuming `source` until `cancel` fires.
    pub fn spawn(source: FrameQueue, cancel: CancellationToken) -> Self {
        let (register_tx, register_rx) = mpsc::channel(16);
        tokio::spawn(
            run_fanout(source, register_rx, cancel).instrument(tracing::info_span!("fanout")),
        );
        Self { register_tx }
    }

    /// Registers a new client and returns its frame source.
    ///
    /// Returns `None` if the fan-out task has stopped.
    pub async fn subscribe(&self) -> Option<FrameSource> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        self.register_tx.send(tx).await.ok()?;
        Some(FrameSource::Dedicated(rx))
    }
}

async fn run_fanout(
    source: FrameQueue,
    mut register_rx: mpsc::Receiver<mpsc::Sender<Frame>>,
    cancel: CancellationToken,
) {
    let mut clients: Vec<mpsc::Sender<Frame>> = Vec::new();
    info!("broadcast fan-out started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(client) = register_rx.recv() => {
                clients.push(client);
                debug!(clients = clients.len(), "client subscribed");
            }

            frame = source.recv() => {
                clients.retain(|client| match client.try_send(frame.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!("client queue full; frame dropped for that client");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    info!("broadcast fan-out stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
