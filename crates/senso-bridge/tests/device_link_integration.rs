//! Integration tests for the device link: `Handle`, sessions and connectors.
//!
//! # Purpose
//!
//! These tests drive the [`Handle`] through its public API against a fake
//! device made of two local `TcpListener`s, one per channel.  They verify:
//!
//! - Commands sent on the Control queue reach the control socket intact and
//!   in order, and a command waits while no connector can take it.
//! - Bytes written by the device show up on the Data queue, but only for a
//!   consumer that is already waiting.
//! - A dropped link is redialed after the retry interval, and an unreachable
//!   device is retried, one retry interval apart, until it appears.
//! - Cancelling a session closes its sockets promptly.
//! - A device that floods the data port never stalls when nobody reads.
//!
//! ```text
//! test ──► handle.control() ──► control connector ──► fake device :control
//! test ◄── handle.data()    ◄── data connector    ◄── fake device :data
//! ```

use std::time::{Duration, Instant};

use senso_bridge::domain::{ChannelRole, ConnectorConfig, ConnectorState};
use senso_bridge::infrastructure::connector::wait_for_state;
use senso_bridge::infrastructure::Handle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(2);

/// Starts a Data queue consumer and gives it time to start waiting.
async fn waiting_consumer(handle: &Handle) -> tokio::task::JoinHandle<Vec<u8>> {
    let data = handle.data().clone();
    let consumer = tokio::spawn(async move { data.recv().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer
}

/// Two listeners standing in for the device's data and control ports.
struct FakeDevice {
    data: TcpListener,
    control: TcpListener,
}

impl FakeDevice {
    async fn bind() -> Self {
        Self {
            data: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            control: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn config(&self, retry_interval: Duration) -> ConnectorConfig {
        ConnectorConfig {
            data_port: self.data.local_addr().unwrap().port(),
            control_port: self.control.local_addr().unwrap().port(),
            dial_timeout: Duration::from_millis(500),
            retry_interval,
            ..ConnectorConfig::default()
        }
    }

    async fn accept_data(&self) -> TcpStream {
        timeout(STEP, self.data.accept()).await.expect("data dial").unwrap().0
    }

    async fn accept_control(&self) -> TcpStream {
        timeout(STEP, self.control.accept()).await.expect("control dial").unwrap().0
    }
}

// ── Relaying ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_commands_reach_control_socket_in_order() {
    // Arrange
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut control = device.accept_control().await;
    let _data = device.accept_data().await;

    // Act: queue several commands; each send waits for the previous one
    let commands: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 16]).collect();
    for command in &commands {
        timeout(STEP, handle.control().send(command.clone()))
            .await
            .expect("control queue stalled");
    }

    // Assert: the device sees the exact byte sequence, in order
    let expected: Vec<u8> = commands.concat();
    let mut received = vec![0u8; expected.len()];
    timeout(STEP, control.read_exact(&mut received))
        .await
        .expect("commands did not arrive")
        .unwrap();
    assert_eq!(received, expected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_device_data_reaches_data_queue() {
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut data = device.accept_data().await;
    let _control = device.accept_control().await;

    let consumer = waiting_consumer(&handle).await;

    data.write_all(b"reading-42").await.unwrap();

    let frame = timeout(STEP, consumer).await.expect("no frame").unwrap();
    assert_eq!(frame, b"reading-42".to_vec());
    session.shutdown().await;
}

#[tokio::test]
async fn test_readings_nobody_waits_for_are_dropped() {
    // Arrange
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut data = device.accept_data().await;
    let _control = device.accept_control().await;

    // Act: a reading arrives before anyone reads the Data queue
    data.write_all(b"stale-reading").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let consumer = waiting_consumer(&handle).await;
    data.write_all(b"fresh").await.unwrap();

    // Assert: the late consumer only sees what arrived while it waited
    let frame = timeout(STEP, consumer).await.expect("no frame").unwrap();
    assert_eq!(frame, b"fresh".to_vec());
    session.shutdown().await;
}

#[tokio::test]
async fn test_command_waits_while_no_session_is_running() {
    let handle = Handle::new(ConnectorConfig::default(), CancellationToken::new());

    let sent = timeout(Duration::from_millis(200), handle.control().send(b"cmd".to_vec())).await;

    assert!(sent.is_err(), "command was accepted with no connector to take it");
}

// ── Reconnecting ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dropped_link_is_redialed_after_retry_interval() {
    // Arrange
    let retry = Duration::from_millis(200);
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(retry), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let _control = device.accept_control().await;

    // Act: the device hangs up on the first data connection
    let first = device.accept_data().await;
    let hung_up = Instant::now();
    drop(first);
    let mut second = device.accept_data().await;
    let gap = hung_up.elapsed();

    // Assert: a new connection arrives, not sooner than the retry pause
    assert!(gap >= retry - Duration::from_millis(20), "redialed after {gap:?}");
    let consumer = waiting_consumer(&handle).await;
    second.write_all(b"again").await.unwrap();
    let frame = timeout(STEP, consumer).await.expect("no frame").unwrap();
    assert_eq!(frame, b"again".to_vec());

    session.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_device_is_retried_until_it_appears() {
    // Arrange: reserve a port, then free it so dials are refused
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let config = ConnectorConfig {
        data_port: port,
        control_port: port,
        dial_timeout: Duration::from_millis(200),
        retry_interval: Duration::from_millis(100),
        ..ConnectorConfig::default()
    };
    let handle = Handle::new(config, CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut state = session.state(ChannelRole::Data);
    assert!(wait_for_state(&mut state, ConnectorState::Retrying, STEP).await);

    // Act: the device comes up on that port
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    // Assert: both connectors get through
    let mut accepted = Vec::new();
    for _ in 0..2 {
        accepted.push(timeout(STEP, listener.accept()).await.expect("no redial").unwrap());
    }
    assert!(wait_for_state(&mut state, ConnectorState::Connected, STEP).await);
    session.shutdown().await;
}

#[tokio::test]
async fn test_refused_dials_are_spaced_by_retry_interval() {
    // Arrange: a port that refuses every dial
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);
    let retry = Duration::from_millis(150);
    let config = ConnectorConfig {
        data_port: port,
        control_port: port,
        dial_timeout: Duration::from_millis(200),
        retry_interval: retry,
        ..ConnectorConfig::default()
    };
    let handle = Handle::new(config, CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut state = session.state(ChannelRole::Data);

    // Act: record when each redial starts
    state.borrow_and_update();
    let mut dials = Vec::new();
    while dials.len() < 3 {
        timeout(STEP, state.changed())
            .await
            .expect("connector stopped dialing")
            .unwrap();
        let current = *state.borrow_and_update();
        assert_ne!(current, ConnectorState::Cancelled, "gave up before cancel");
        if current == ConnectorState::Dialing {
            dials.push(Instant::now());
        }
    }

    // Assert: three redials, never closer than the retry pause
    assert_eq!(dials.len(), 3);
    for pair in dials.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= retry - Duration::from_millis(20), "redialed after {gap:?}");
    }

    session.cancel();
    assert!(wait_for_state(&mut state, ConnectorState::Cancelled, Duration::from_secs(1)).await);
    session.shutdown().await;
}

// ── Cancelling ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_closes_device_sockets_promptly() {
    // Arrange
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut data = device.accept_data().await;
    let mut control = device.accept_control().await;

    // Act
    session.cancel();

    // Assert: both sockets see end-of-stream (or a reset) within a second
    for socket in [&mut data, &mut control] {
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(1), socket.read(&mut buf))
            .await
            .expect("socket still open after cancel");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
    session.shutdown().await;
}

#[tokio::test]
async fn test_commands_wait_for_the_next_connection() {
    // Arrange: a session whose control link dies
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(100)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let _data = device.accept_data().await;
    let mut state = session.state(ChannelRole::Control);
    drop(device.accept_control().await);
    assert!(wait_for_state(&mut state, ConnectorState::Retrying, STEP).await);

    // Act: a command is sent while the connector is between connections
    let sender = {
        let control = handle.control().clone();
        tokio::spawn(async move { control.send(b"later".to_vec()).await })
    };
    let mut control = device.accept_control().await;

    // Assert: it is written on the new connection
    let mut received = [0u8; 5];
    timeout(STEP, control.read_exact(&mut received))
        .await
        .expect("command lost")
        .unwrap();
    assert_eq!(&received, b"later");
    timeout(STEP, sender).await.expect("send never completed").unwrap();
    session.shutdown().await;
}

// ── Backpressure ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_device_flood_never_stalls_without_a_consumer() {
    // Arrange: nobody ever reads the Data queue
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), CancellationToken::new());
    let session = handle.connect("127.0.0.1");
    let mut data = device.accept_data().await;
    let _control = device.accept_control().await;

    // Act: the device writes a megabyte
    let flood = vec![0x5Au8; 1024 * 1024];
    let written = timeout(Duration::from_secs(5), data.write_all(&flood)).await;

    // Assert: the bridge kept draining the socket, dropping what nobody took
    assert!(written.is_ok(), "device write stalled");
    written.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn test_parent_token_stops_every_session() {
    let root = CancellationToken::new();
    let device = FakeDevice::bind().await;
    let handle = Handle::new(device.config(Duration::from_millis(200)), root.clone());
    let session = handle.connect("127.0.0.1");
    let mut data = device.accept_data().await;
    let _control = device.accept_control().await;

    root.cancel();

    let mut buf = [0u8; 4];
    let read = timeout(Duration::from_secs(1), data.read(&mut buf))
        .await
        .expect("socket still open after root cancel");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(session.is_cancelled());
}
