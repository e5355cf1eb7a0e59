//! WebSocket server: accept loop and per-client bridge.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from browsers.
//! 3. Upgrading each connection to a WebSocket session (any path unless a
//!    path filter is configured, any origin).
//! 4. Running two concurrent pumps per client:
//!    - **Outbound**: frames from the Data queue → binary WebSocket messages.
//!    - **Inbound**: binary WebSocket messages → the Control queue.
//! 5. Stopping when the cancellation token fires.
//!
//! # Origin policy
//!
//! Every origin is accepted ([`OriginPolicy::AllowAny`]).  The bridge serves
//! a trusted local network and carries no authentication; the origin is
//! logged on every upgrade so the policy stays visible.
//!
//! # Failed upgrades
//!
//! A request that is not a valid WebSocket upgrade gets a plain
//! `400 Bad Request`.  The handshake runs on a borrowed socket so the
//! connection is still ours to answer when the handshake gives up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::application::RelayError;
use crate::domain::{DeliveryMode, GatewayConfig, OriginPolicy};
use crate::infrastructure::fanout::{Broadcaster, FrameSource};
use crate::infrastructure::queue::FrameQueue;
use crate::infrastructure::supervisor::Handle;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on answering a rejected request.
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.ws_bind_addr` and serves clients until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (e.g., the port is
/// already in use or the process lacks permission to bind).
pub async fn run_server(
    config: &GatewayConfig,
    handle: &Handle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket listener on {}",
                config.ws_bind_addr
            )
        })?;

    info!("WebSocket bridge listening on {}", config.ws_bind_addr);
    serve(listener, config, handle, cancel).await
}

/// Accepts clients on an already-bound `listener` until `cancel` fires.
///
/// Each client runs in its own task under a child of `cancel`.  In
/// broadcast mode a fan-out task is started first and owns the Data queue.
pub async fn serve(
    listener: TcpListener,
    config: &GatewayConfig,
    handle: &Handle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let broadcaster = match config.delivery_mode {
        DeliveryMode::Shared => None,
        DeliveryMode::Broadcast => Some(Broadcaster::spawn(
            handle.data().clone(),
            cancel.child_token(),
        )),
    };

    let ctx = Arc::new(EndpointContext {
        data: handle.data().clone(),
        control: handle.control().clone(),
        broadcaster,
        ws_config: ws_config(config.ws_buffer_size),
        ws_path: config.ws_path.clone(),
        origin_policy: config.origin_policy,
        write_timeout: config.ws_write_timeout,
    });

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested; stopping accept loop");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let client = Uuid::new_v4();
                let span = tracing::info_span!("ws_client", %client, %peer);
                let ctx = Arc::clone(&ctx);
                let client_cancel = cancel.child_token();
                tokio::spawn(handle_client(stream, peer, ctx, client_cancel).instrument(span));
            }
            Err(e) => {
                // Transient accept error; keep the bridge up.
                error!("accept error: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    Ok(())
}

// ── Per-client bridge ─────────────────────────────────────────────────────────

/// Everything a client task needs, shared across all clients.
struct EndpointContext {
    data: FrameQueue,
    control: FrameQueue,
    broadcaster: Option<Broadcaster>,
    ws_config: WebSocketConfig,
    ws_path: Option<String>,
    origin_policy: OriginPolicy,
    write_timeout: Duration,
}

impl EndpointContext {
    async fn frame_source(&self) -> Option<FrameSource> {
        match &self.broadcaster {
            Some(broadcaster) => broadcaster.subscribe().await,
            None => Some(FrameSource::Shared(self.data.clone())),
        }
    }
}

/// Request details kept for logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RequestInfo {
    path: String,
    user_agent: Option<String>,
    origin: Option<String>,
}

impl RequestInfo {
    fn from_request(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            path: request.uri().path().to_string(),
            user_agent: header("user-agent"),
            origin: header("origin"),
        }
    }
}

/// Upgrades one connection and runs its two pumps until the client leaves.
async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<EndpointContext>,
    cancel: CancellationToken,
) {
    let upgraded = tokio::select! {
        _ = cancel.cancelled() => return,
        upgraded = upgrade(&mut stream, &ctx) => upgraded,
    };

    let request = match upgraded {
        Ok(request) => request,
        Err(WsError::Http(response)) => {
            // The handshake already sent this response.
            warn!(status = %response.status(), "upgrade refused");
            return;
        }
        Err(e) => {
            let e = RelayError::Upgrade(e.to_string());
            error!(error = %e, "websocket upgrade error");
            reject_bad_request(&mut stream).await;
            return;
        }
    };

    info!(
        path = %request.path,
        user_agent = request.user_agent.as_deref().unwrap_or("-"),
        origin = request.origin.as_deref().unwrap_or("-"),
        "WebSocket connection opened"
    );

    let Some(source) = ctx.frame_source().await else {
        warn!("frame fan-out stopped; closing client");
        return;
    };

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, Some(ctx.ws_config)).await;
    let (sink, ws_source) = ws.split();

    let outbound = tokio::spawn(
        pump_outbound(sink, source, ctx.write_timeout, cancel.clone()).in_current_span(),
    );
    let inbound =
        tokio::spawn(pump_inbound(ws_source, ctx.control.clone(), cancel.clone()).in_current_span());

    for (name, task) in [("outbound", outbound), ("inbound", inbound)] {
        if let Err(e) = task.await {
            error!(pump = name, error = %e, "pump panicked");
        }
    }

    info!(%peer, "WebSocket connection closed");
}

/// Runs the WebSocket handshake on a borrowed socket.
///
/// Returns the request details on success.  On failure the error tells the
/// caller whether a response was already written ([`WsError::Http`]) or the
/// client is still owed one.
async fn upgrade(stream: &mut TcpStream, ctx: &EndpointContext) -> Result<RequestInfo, WsError> {
    let mut accepted = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let info = RequestInfo::from_request(request);
        if let Some(path) = &ctx.ws_path {
            if info.path != *path {
                return Err(error_response(StatusCode::NOT_FOUND, "not found"));
            }
        }
        if !ctx.origin_policy.allows(info.origin.as_deref()) {
            return Err(error_response(StatusCode::FORBIDDEN, "origin not allowed"));
        }
        accepted = Some(info);
        Ok(response)
    };

    // Only the handshake happens on the borrowed socket; the WebSocket itself
    // is rebuilt on the owned stream afterwards.
    let handshake = accept_hdr_async_with_config(&mut *stream, callback, Some(ctx.ws_config)).await?;
    drop(handshake);

    Ok(accepted.unwrap_or_default())
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Answers a failed upgrade with `400 Bad Request` and closes the socket.
async fn reject_bad_request(stream: &mut TcpStream) {
    const BODY: &str = "WebSocket upgrade error\n";
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {BODY}",
        BODY.len()
    );

    let answer = async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    };
    match timeout(REJECT_TIMEOUT, answer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("could not send 400 response: {e}"),
        Err(_) => debug!("timed out sending 400 response"),
    }
}

/// WebSocket settings for upgraded clients.
fn ws_config(buffer_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = buffer_size;
    config
}

// ── Pumps ─────────────────────────────────────────────────────────────────────

/// Sends frames from `source` to the client, one binary message per frame.
///
/// Stops on the first failed or late send, or when `cancel` fires, then
/// cancels the sibling pump and closes the socket.
async fn pump_outbound(
    mut sink: WsSink,
    mut source: FrameSource,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match timeout(write_timeout, sink.send(WsMessage::Binary(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                match unexpected_close(&e) {
                    Some(e) => error!(error = %e, "WebSocket error"),
                    None => debug!("client closed while sending"),
                }
                break;
            }
            Err(_) => {
                error!(timeout = ?write_timeout, "WebSocket write timed out");
                break;
            }
        }
    }

    cancel.cancel();
    if let Ok(Err(e)) = timeout(write_timeout, sink.close()).await {
        debug!("closing WebSocket: {e}");
    }
}

/// Forwards binary messages from the client into the Control queue.
///
/// Each message is forwarded with an awaited send: a slow device link slows
/// the client down instead of losing commands.  Stops on close, on a read
/// error, or when `cancel` fires, then cancels the sibling pump.
async fn pump_inbound(mut ws_source: WsSource, control: FrameQueue, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_source.next() => message,
        };

        match message {
            Some(Ok(WsMessage::Binary(payload))) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = control.send(payload) => {}
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                if is_graceful_close(frame.as_ref()) {
                    debug!("client closed the connection");
                } else {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no status".to_string());
                    error!(error = %RelayError::UnexpectedClose(reason), "WebSocket error");
                }
                break;
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                // Pong replies are queued by tungstenite itself.
            }
            Some(Ok(WsMessage::Text(_) | WsMessage::Frame(_))) => {
                debug!("got a non-binary message; dropped");
            }
            Some(Err(e)) => {
                match unexpected_close(&e) {
                    Some(e) => error!(error = %e, "WebSocket error"),
                    None => debug!("client connection closed"),
                }
                break;
            }
            None => {
                debug!("client stream ended");
                break;
            }
        }
    }

    cancel.cancel();
}

// ── Close classification ──────────────────────────────────────────────────────

/// True if a Close frame carries one of the expected codes: normal closure
/// (1000) or going away (1001).
pub fn is_graceful_close(frame: Option<&CloseFrame<'_>>) -> bool {
    matches!(
        frame.map(|f| f.code),
        Some(CloseCode::Normal) | Some(CloseCode::Away)
    )
}

/// Maps a WebSocket error to [`RelayError::UnexpectedClose`], or `None` if it
/// only says the connection was already closed cleanly.
pub fn unexpected_close(error: &WsError) -> Option<RelayError> {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => None,
        other => Some(RelayError::UnexpectedClose(other.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
