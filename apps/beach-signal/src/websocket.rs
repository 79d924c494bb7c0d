use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::hub::SignalingHub;
use crate::protocol::{ClientMessage, HandshakeQuery, ServerMessage};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::server::AppState;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("client closed socket before handshake")]
    SocketClosed,
    #[error("socket closed during handshake: {0:?}")]
    Closed(Option<String>),
    #[error("client sent invalid payload: {0}")]
    InvalidPayload(String),
    #[error("expected connect, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Rejected(#[from] AuthError),
}

impl HandshakeError {
    fn label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed | HandshakeError::Closed(_) => "closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::UnexpectedMessage(_) => "unexpected_message",
            HandshakeError::Protocol(_) => "protocol",
            HandshakeError::Rejected(AuthError::InvalidCredential) => "invalid_credential",
            HandshakeError::Rejected(AuthError::MissingIdentity) => "missing_identity",
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(query): Query<HandshakeQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, remote_addr))
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    query: HandshakeQuery,
    remote_addr: SocketAddr,
) {
    let connection_id = state.hub.next_connection_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();

    debug!(connection_id, %remote_addr, "websocket upgraded");

    let admitted = admit(
        &state.hub,
        ConnectionHandle::new(connection_id, tx),
        query,
        state.handshake_timeout,
        &mut ws_rx,
    )
    .await;

    let identity = match admitted {
        Ok(identity) => identity,
        Err(err) => {
            counter!("beach_signal_handshake_failures_total", 1, "reason" => err.label());
            warn!(connection_id, %remote_addr, error = %err, "handshake failed, closing");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Owned(err.to_string()),
                })))
                .await;
            return;
        }
    };

    let mut writer = tokio::spawn(forward_outbound(ws_tx, rx, connection_id));

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&state.hub, connection_id, &text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => dispatch(&state.hub, connection_id, &text),
                Err(_) => debug!(connection_id, "ignoring non-UTF8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    // Dropping the registry's sender ends the writer once its queue is flushed.
    state.hub.disconnect(connection_id);
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!(connection_id, "writer did not drain in time");
        writer.abort();
    }

    info!(connection_id, %identity, %remote_addr, "websocket closed");
}

/// Runs the handshake: credentials from the upgrade query when present,
/// otherwise from a `connect` frame that must arrive within `wait`.
async fn admit(
    hub: &SignalingHub,
    handle: ConnectionHandle,
    query: HandshakeQuery,
    wait: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<String, HandshakeError> {
    let (identity, credential) = match query.credentials() {
        Some(credentials) => credentials,
        None => read_connect_frame(wait, ws_rx).await?,
    };

    hub.connect(handle, &identity, &credential)?;
    Ok(identity)
}

async fn read_connect_frame(
    wait: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<(String, String), HandshakeError> {
    let deadline = Instant::now() + wait;
    let message = loop {
        let frame = timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| HandshakeError::TimedOut)?
            .ok_or(HandshakeError::SocketClosed)?
            .map_err(|err| HandshakeError::Protocol(err.to_string()))?;

        match frame {
            Message::Text(text) => {
                break serde_json::from_str::<ClientMessage>(&text)
                    .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?
            }
            Message::Binary(bytes) => {
                break serde_json::from_slice::<ClientMessage>(&bytes)
                    .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?
            }
            Message::Close(frame) => {
                return Err(HandshakeError::Closed(frame.map(|f| f.reason.to_string())));
            }
            // Keepalives may precede the connect frame.
            Message::Ping(_) | Message::Pong(_) => continue,
        }
    };

    match message {
        ClientMessage::Connect {
            identity,
            credential,
        } => Ok((identity, credential)),
        other => Err(HandshakeError::UnexpectedMessage(other.kind())),
    }
}

/// Writes queued messages until every sender is gone, then closes the sink.
async fn forward_outbound<S>(
    mut ws_tx: S,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(message) = rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(err) => {
                warn!(connection_id, error = %err, "failed to encode server message");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
    debug!(connection_id, "writer task finished");
}

/// Malformed frames are dropped; the connection stays up.
fn dispatch(hub: &SignalingHub, connection_id: ConnectionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => {
            debug!(connection_id, kind = message.kind(), "client message");
            hub.handle_message(connection_id, message);
        }
        Err(err) => {
            counter!("beach_signal_malformed_frames_total", 1);
            warn!(connection_id, error = %err, "dropping malformed frame");
        }
    }
}
