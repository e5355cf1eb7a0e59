//! Session supervisor: the programmatic surface of the bridge.
//!
//! A [`Handle`] owns the two long-lived queues of the device link:
//!
//! - the **Data** queue, carrying frames read from the device, and
//! - the **Control** queue, carrying frames to write to the device.
//!
//! [`Handle::connect`] starts a session: one [`Connector`] per channel role,
//! both under a child of the handle's cancellation token.  The returned
//! [`SessionGuard`] cancels that session without touching the queues or any
//! other session.
//!
//! ```text
//! Handle (token T)
//!  ├── data queue ◄──────────── data connector     ┐
//!  ├── control queue ─────────► control connector  ┘ session (token T.child)
//!  └── ...more sessions may share the same queues
//! ```

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::{ChannelRole, ConnectorConfig, ConnectorState};
use crate::infrastructure::connector::{spawn_connector, Connector};
use crate::infrastructure::queue::FrameQueue;

/// Long-lived owner of the Data and Control queues.
///
/// Create one per process (or per device) and keep it for the whole run.
/// The queues are created here once and survive every reconnect and every
/// session.
#[derive(Debug)]
pub struct Handle {
    data: FrameQueue,
    control: FrameQueue,
    config: ConnectorConfig,
    cancel: CancellationToken,
}

impl Handle {
    /// Creates a handle whose sessions all stop when `cancel` fires.
    pub fn new(config: ConnectorConfig, cancel: CancellationToken) -> Self {
        Self {
            data: FrameQueue::new(),
            control: FrameQueue::new(),
            config,
            cancel,
        }
    }

    /// Frames read from the device.
    pub fn data(&self) -> &FrameQueue {
        &self.data
    }

    /// Frames to be written to the device's control channel.
    pub fn control(&self) -> &FrameQueue {
        &self.control
    }

    /// The connector settings sessions are started with.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Starts connecting to the device at `address` (host name or IP, no
    /// port).
    ///
    /// Returns immediately.  The connectors keep dialing in the background
    /// until the returned guard or the handle's token is cancelled.
    /// Dropping the guard does not stop the session.
    pub fn connect(&self, address: &str) -> SessionGuard {
        let cancel = self.cancel.child_token();
        info!(address, "attempting to connect");

        let mut states = Vec::with_capacity(ChannelRole::ALL.len());
        let mut tasks = Vec::with_capacity(ChannelRole::ALL.len());
        for role in ChannelRole::ALL {
            let (connector, state) = Connector::new(
                role,
                address,
                self.config.clone(),
                self.data.clone(),
                self.control.clone(),
            );
            tasks.push(spawn_connector(connector, cancel.clone()));
            states.push((role, state));
        }

        SessionGuard {
            address: address.to_string(),
            cancel,
            states,
            tasks,
        }
    }
}

/// Cancellation handle for one session started by [`Handle::connect`].
#[derive(Debug)]
pub struct SessionGuard {
    address: String,
    cancel: CancellationToken,
    states: Vec<(ChannelRole, watch::Receiver<ConnectorState>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionGuard {
    /// The device address this session connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stops both connectors.  Sockets close as their tasks unwind.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once [`cancel`](Self::cancel) was called or the parent token
    /// fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A watcher of the connector state for `role`.
    pub fn state(&self, role: ChannelRole) -> watch::Receiver<ConnectorState> {
        self.states
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, state)| state.clone())
            .unwrap_or_else(|| watch::channel(ConnectorState::Cancelled).1)
    }

    /// Cancels the session and waits for every connector task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "connector task panicked");
            }
        }
        info!(address = %self.address, "session stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
