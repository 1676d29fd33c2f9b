use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::lifecycle::{ConnectionLifecycle, ConnectionState, LifecycleError};
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};
use crate::routing::RouteError;
use crate::server::AppState;

use super::message::{ClientMessage, OutboundFrame, ServerMessage};

/// How long the writer gets to flush queued frames once the connection is closing
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let authenticated_user = match extract_token(&query, &headers) {
        Some(token) => match state.jwt_validator.validate(&token) {
            Ok(claims) => Some(claims.user_id().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "JWT validation failed");
                return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
            }
        },
        None if state.jwt_validator.is_required() => {
            return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
        }
        None => None,
    };

    tracing::debug!(authenticated_user = ?authenticated_user, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, authenticated_user))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Drive one WebSocket connection from upgrade to close
async fn handle_socket(socket: WebSocket, state: AppState, authenticated_user: Option<String>) {
    let (ws_sender, ws_receiver) = socket.split();
    run_connection(ws_sender, ws_receiver, state, authenticated_user).await;
}

/// Connection loop over any frame sink and stream
async fn run_connection<S, R, E>(
    ws_sender: S,
    mut ws_receiver: R,
    state: AppState,
    authenticated_user: Option<String>,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let connection_start = std::time::Instant::now();
    let (tx, rx) = mpsc::channel::<OutboundFrame>(state.settings.websocket.channel_buffer_size);
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        state.presence.clone(),
        tx,
        authenticated_user,
    ));
    let connection_id = lifecycle.id();

    ConnectionMetrics::record_opened();
    tracing::info!(connection_id = %connection_id, "WebSocket connection accepted");

    let presence_rx = lifecycle.presence_slot();
    let (flush_tx, flush_rx) = oneshot::channel::<()>();
    let mut send_task = tokio::spawn(write_frames(ws_sender, rx, presence_rx, flush_rx));

    let recv_state = state.clone();
    let recv_lifecycle = lifecycle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_state, &recv_lifecycle).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let identity_timeout = Duration::from_secs(state.settings.websocket.connection_timeout);
    let identity_deadline = {
        let lifecycle = lifecycle.clone();
        async move {
            tokio::time::sleep(identity_timeout).await;
            if lifecycle.state() != ConnectionState::Connecting {
                std::future::pending::<()>().await;
            }
        }
    };

    let mut shutdown_rx = state.shutdown.subscribe();
    let mut writer_done = false;

    tokio::select! {
        _ = &mut send_task => {
            writer_done = true;
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
        _ = lifecycle.close_requested() => {
            tracing::info!(connection_id = %connection_id, "Close requested");
        }
        _ = shutdown_rx.recv() => {
            tracing::debug!(connection_id = %connection_id, "Closing for shutdown");
        }
        _ = identity_deadline => {
            tracing::info!(connection_id = %connection_id, "No identity announced in time");
        }
    }

    recv_task.abort();
    lifecycle.close().await;

    // Let the writer flush anything already queued, then send a close frame
    if !writer_done {
        let _ = flush_tx.send(());
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
            send_task.abort();
        }
    }

    let duration = connection_start.elapsed().as_secs_f64();
    ConnectionMetrics::record_closed(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = ?lifecycle.handle().map(|h| h.user_id.as_str()),
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

/// Forward queued frames to the socket until the channel closes, the socket
/// fails, or a flush is requested.
///
/// Queued frames go first. A presence snapshot parked while the queue was
/// full is written once the queue is empty, unless a newer one already went
/// out through the queue.
async fn write_frames<S>(
    ws_sender: S,
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut presence_rx: watch::Receiver<Option<OutboundFrame>>,
    mut flush_rx: oneshot::Receiver<()>,
) where
    S: Sink<Message> + Unpin,
{
    let mut writer = FrameWriter::new(ws_sender);
    let mut slot_open = true;

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if !writer.write(frame).await {
                    return;
                }
            }
            changed = presence_rx.changed(), if slot_open => {
                if changed.is_err() {
                    slot_open = false;
                    continue;
                }
                let parked = presence_rx.borrow_and_update().clone();
                if let Some(frame) = parked {
                    if !writer.write(frame).await {
                        return;
                    }
                }
            }
            _ = &mut flush_rx => {
                while let Ok(frame) = rx.try_recv() {
                    if !writer.write(frame).await {
                        return;
                    }
                }
                if presence_rx.has_changed().unwrap_or(false) {
                    let parked = presence_rx.borrow_and_update().clone();
                    if let Some(frame) = parked {
                        if !writer.write(frame).await {
                            return;
                        }
                    }
                }
                break;
            }
        }
    }

    writer.close().await;
}

struct FrameWriter<S> {
    sink: S,
    last_presence_seq: u64,
}

impl<S> FrameWriter<S>
where
    S: Sink<Message> + Unpin,
{
    fn new(sink: S) -> Self {
        Self {
            sink,
            last_presence_seq: 0,
        }
    }

    /// Returns false once the socket is gone
    async fn write(&mut self, frame: OutboundFrame) -> bool {
        if let OutboundFrame::Presence { seq, .. } = frame {
            if seq <= self.last_presence_seq {
                return true;
            }
            self.last_presence_seq = seq;
        }

        let text = match frame.to_json() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return true;
            }
        };

        if self.sink.send(Message::Text(text.into())).await.is_err() {
            return false;
        }

        // The client's automatic pong refreshes activity for read-only clients
        if matches!(frame, OutboundFrame::Heartbeat) {
            return self.sink.send(Message::Ping(Bytes::new())).await.is_ok();
        }

        true
    }

    async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(msg: Message, state: &AppState, lifecycle: &ConnectionLifecycle) -> bool {
    if let Some(handle) = lifecycle.handle() {
        handle.update_activity();
    }

    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    WsMessageMetrics::record_invalid();
                    tracing::warn!(connection_id = %lifecycle.id(), error = %e, "Failed to parse client message");
                    lifecycle
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                        .await;
                    return true;
                }
            };

            WsMessageMetrics::record(client_msg.kind());
            handle_client_message(client_msg, state, lifecycle).await
        }
        Message::Binary(_) => {
            WsMessageMetrics::record_invalid();
            lifecycle
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        // Axum answers pings itself; activity was updated above, which also
        // covers pongs to the heartbeat ping
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(connection_id = %lifecycle.id(), "Received close frame");
            false
        }
    }
}

/// Handle a parsed client message
/// Returns false if the connection should be closed
#[tracing::instrument(
    name = "ws.message",
    skip(state, lifecycle, msg),
    fields(connection_id = %lifecycle.id(), message_type = msg.kind())
)]
async fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    lifecycle: &ConnectionLifecycle,
) -> bool {
    match msg {
        ClientMessage::IdentityAnnounce { user_id } => {
            match lifecycle.announce_identity(user_id).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Identity announcement rejected");
                    lifecycle.send(ServerMessage::error(e.code(), e.to_string())).await;
                    !matches!(e, LifecycleError::Presence(_))
                }
            }
        }
        ClientMessage::MessageSent { chat_id, payload } => {
            let Some(handle) = lifecycle.handle() else {
                lifecycle
                    .send(ServerMessage::error(
                        "NOT_IDENTIFIED",
                        "Announce an identity before sending messages",
                    ))
                    .await;
                return true;
            };

            if let Err(e) = state
                .router
                .route_chat_message(&handle.user_id, &chat_id, payload)
                .await
            {
                tracing::warn!(chat_id = %chat_id, error = %e, "Message not routed");
                lifecycle.send(ServerMessage::error(route_error_code(&e), e.to_string())).await;
            }
            true
        }
        ClientMessage::Ping => {
            lifecycle.send(ServerMessage::Pong).await;
            true
        }
    }
}

fn route_error_code(err: &RouteError) -> &'static str {
    match err {
        RouteError::ChatNotFound(_) => "CHAT_NOT_FOUND",
        RouteError::NotAParticipant { .. } => "NOT_A_PARTICIPANT",
        RouteError::Directory(_) => "UNAVAILABLE",
    }
}
