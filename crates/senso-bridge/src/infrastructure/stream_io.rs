//! Per-socket read and write pumps.
//!
//! A connected device socket is split into its read and write halves, and
//! each half is driven by its own task:
//!
//! ```text
//! socket read half  ──► run_reader ──► read queue  ──► connector
//! connector ──► write queue ──► run_writer ──► socket write half
//!                                   │
//!                                   └──► error queue ──► connector
//! ```
//!
//! Neither pump interprets the bytes.  A frame is exactly what one `read()`
//! returned, or exactly what one write must deliver.
//!
//! Both functions are generic over tokio's `AsyncRead`/`AsyncWrite` so they
//! run equally on `tcp::OwnedReadHalf`/`OwnedWriteHalf` and on in-memory
//! duplex pipes in tests.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::application::{classify_read, ReadOutcome, RelayError};
use crate::domain::Frame;

// ── Reader ────────────────────────────────────────────────────────────────────

/// Reads from `reader` and forwards every chunk as one frame on `tx`.
///
/// Runs until end-of-stream, a read error, cancellation, or until the
/// receiving side of `tx` is gone.  Returning drops `tx`, which is how the
/// connector learns that the read side is over.
///
/// Each frame is a copy of the filled part of the buffer, so the next read
/// never overwrites bytes that were already handed on.
///
/// # Parameters
///
/// - `reader`       – Read half of the device socket.
/// - `tx`           – Read queue towards the connector.
/// - `buffer_size`  – Size of the read buffer (largest possible frame).
/// - `read_timeout` – Optional per-read deadline.  An elapsed deadline is not
///   an error; the loop reads again, which also gives cancellation a chance.
/// - `cancel`       – Connection-scoped cancellation token.
pub async fn run_reader<R>(
    mut reader: R,
    tx: mpsc::Sender<Frame>,
    buffer_size: usize,
    read_timeout: Option<Duration>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reader cancelled");
                return;
            }
            result = read_once(&mut reader, &mut buffer, read_timeout) => result,
        };

        match classify_read(result) {
            ReadOutcome::Data(n) => {
                let frame = buffer[..n].to_vec();
                trace!(bytes = n, "read frame");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("reader cancelled");
                        return;
                    }
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            debug!("read queue closed; exiting reader");
                            return;
                        }
                    }
                }
            }
            ReadOutcome::Retry => continue,
            ReadOutcome::Finished(RelayError::Eof) => {
                info!("connection closed");
                return;
            }
            ReadOutcome::Finished(e) => {
                error!(error = %e, "read error");
                return;
            }
        }
    }
}

/// Performs one read, bounded by `read_timeout` when one is configured.
async fn read_once<R>(
    reader: &mut R,
    buffer: &mut [u8],
    read_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match read_timeout {
        Some(deadline) => match timeout(deadline, reader.read(buffer)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed")),
        },
        None => reader.read(buffer).await,
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Writes every frame received on `rx` to `writer`.
///
/// Runs until `rx` is closed (every sender dropped) or `cancel` fires.
/// Failures are reported on `errors` and the loop carries on; deciding
/// whether a failure ends the connection is the connector's job.
///
/// `writer` is an `Option` so a writer can exist before (or without) a
/// socket.  In that case every frame yields [`RelayError::NotConnected`].
///
/// The error queue is unbounded so that reporting a failure never waits on
/// the connector, which may itself be waiting to hand this task a frame.
pub async fn run_writer<W>(
    mut writer: Option<W>,
    mut rx: mpsc::Receiver<Frame>,
    errors: mpsc::UnboundedSender<RelayError>,
    write_timeout: Duration,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("writer cancelled");
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    debug!("write queue closed; exiting writer");
                    break;
                }
            },
        };

        let result = match writer.as_mut() {
            None => Err(RelayError::NotConnected),
            Some(w) => tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("writer cancelled mid-write");
                    break;
                }
                result = write_frame(w, &frame, write_timeout) => result,
            },
        };

        match result {
            Ok(()) => trace!(bytes = frame.len(), "wrote frame"),
            Err(e) => {
                if errors.send(e).is_err() {
                    debug!("error queue closed; exiting writer");
                    break;
                }
            }
        }
    }
}

/// Writes one whole frame under `write_timeout`.
///
/// # Errors
///
/// [`RelayError::WriteTimeout`] if the deadline elapsed, otherwise
/// [`RelayError::WriteFailed`] with the underlying I/O error.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        // `write_all` keeps going until every byte is accepted, even if the
        // OS only takes part of the frame on the first call.
        writer.write_all(frame).await?;
        writer.flush().await
    };

    match timeout(write_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::WriteFailed(e)),
        Err(_) => Err(RelayError::WriteTimeout(write_timeout)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_reader_forwards_bytes_and_closes_on_eof() {
        // Arrange: an in-memory pipe standing in for the device socket
        let (mut device, socket) = duplex(4096);
        let (tx, mut rx) = mpsc::channel(8);
        let reader = tokio::spawn(run_reader(socket, tx, 1024, None, CancellationToken::new()));

        // Act: the device sends one chunk and hangs up
        device.write_all(b"hello").await.unwrap();
        device.flush().await.unwrap();
        let frame = rx.recv().await;
        drop(device);

        // Assert: the chunk arrives untouched, then the queue closes
        assert_eq!(frame, Some(b"hello".to_vec()));
        assert_eq!(rx.recv().await, None);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_frames_never_exceed_buffer_size() {
        let (mut device, socket) = duplex(8192);
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(run_reader(socket, tx, 16, None, CancellationToken::new()));

        device.write_all(&[7u8; 100]).await.unwrap();
        drop(device);

        let mut total = 0;
        while let Some(frame) = rx.recv().await {
            assert!(frame.len() <= 16);
            total += frame.len();
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_reader_frames_do_not_alias_the_buffer() {
        // Arrange: a reader whose frames we hold on to while it keeps reading
        let (mut device, socket) = duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_reader(socket, tx, 8, None, CancellationToken::new()));

        // Act
        device.write_all(b"AAAA").await.unwrap();
        let first = rx.recv().await.unwrap();
        device.write_all(b"BBBB").await.unwrap();
        let second = rx.recv().await.unwrap();

        // Assert: the first frame still holds its own bytes
        assert_eq!(first, b"AAAA");
        assert_eq!(second, b"BBBB");
    }

    #[tokio::test]
    async fn test_reader_keeps_going_across_read_timeouts() {
        let (mut device, socket) = duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_reader(
            socket,
            tx,
            64,
            Some(Duration::from_millis(10)),
            CancellationToken::new(),
        ));

        // Several read deadlines elapse before any data shows up.
        tokio::time::sleep(Duration::from_millis(60)).await;
        device.write_all(b"late").await.unwrap();

        assert_eq!(rx.recv().await, Some(b"late".to_vec()));
    }

    #[tokio::test]
    async fn test_reader_stops_on_cancel() {
        let (_device, socket) = duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(run_reader(socket, tx, 64, None, cancel.clone()));

        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader must stop promptly")
            .unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_writes_frames_in_order() {
        let (mut device, socket) = duplex(4096);
        let (tx, rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            Some(socket),
            rx,
            err_tx,
            WRITE_TIMEOUT,
            CancellationToken::new(),
        ));

        for chunk in [&b"one"[..], b"two", b"three"] {
            tx.send(chunk.to_vec()).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        let mut received = Vec::new();
        device.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"onetwothree");
    }

    #[tokio::test]
    async fn test_writer_without_socket_reports_not_connected() {
        let (tx, rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            None::<tokio::io::DuplexStream>,
            rx,
            err_tx,
            WRITE_TIMEOUT,
            CancellationToken::new(),
        ));

        tx.send(vec![1, 2, 3]).await.unwrap();

        let err = err_rx.recv().await.unwrap();
        assert!(matches!(err, RelayError::NotConnected));
    }

    #[tokio::test]
    async fn test_write_frame_times_out_when_peer_stops_reading() {
        // Arrange: a pipe with a tiny buffer that nobody drains
        let (_device, mut socket) = duplex(4);

        // Act
        let result = write_frame(&mut socket, &[0u8; 64], WRITE_TIMEOUT).await;

        // Assert
        assert!(matches!(result, Err(RelayError::WriteTimeout(_))));
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_write_frame_fails_when_peer_is_gone() {
        let (device, mut socket) = duplex(64);
        drop(device);

        let result = write_frame(&mut socket, b"data", WRITE_TIMEOUT).await;

        let err = result.unwrap_err();
        assert!(matches!(err, RelayError::WriteFailed(_)));
        assert!(!err.is_transient());
    }
}
