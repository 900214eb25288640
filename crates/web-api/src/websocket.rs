//! WebSocket 处理器
//!
//! 先完成升级再认证：认证失败时以 1008 关闭码关闭连接。认证通过后连接按身份播种房间，
//! 由写循环独占套接字的发送端，其它组件只通过有界通道投递事件。

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use application::ApplicationError;
use domain::{
    seed_rooms, AuthError, ClientEnvelope, ClientMessage, CloseReason, ConnectionHandle,
    ConnectionState, Delivery, Identity, RealtimeError, ServerEvent,
};

use crate::state::AppState;

const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket连接查询参数
#[derive(Debug, Default, Deserialize)]
pub struct WebSocketQuery {
    /// JWT access token
    #[serde(default)]
    pub token: Option<String>,
}

/// 处理WebSocket连接升级
pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WebSocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// 跟踪连接状态，非法转换只记录日志
struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        match self.state.advance(next) {
            Ok(state) => self.state = state,
            Err(err) => error!(error = %err, "connection lifecycle violated"),
        }
    }
}

async fn authenticate(state: &AppState, token: Option<&str>) -> Result<Identity, CloseReason> {
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(CloseReason::MissingToken)?;

    match state.sessions.authenticate(token).await {
        Ok(identity) => Ok(identity),
        Err(ApplicationError::Auth(AuthError::UnknownIdentity)) => {
            Err(CloseReason::UnknownIdentity)
        }
        Err(ApplicationError::Store(err)) | Err(ApplicationError::Auth(AuthError::Store(err))) => {
            error!(error = %err, "identity lookup failed during websocket handshake");
            Err(CloseReason::InvalidToken)
        }
        Err(err) => {
            debug!(error = %err, "websocket token rejected");
            Err(CloseReason::InvalidToken)
        }
    }
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.description()),
    }))
}

async fn reject(mut socket: WebSocket, reason: CloseReason) {
    let rejection = RealtimeError::ConnectionRejected(reason);
    warn!(code = reason.code(), reason = %rejection, "websocket connection rejected");
    if let Err(err) = socket.send(close_message(reason)).await {
        debug!(error = %err, "failed to send close frame");
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let mut lifecycle = Lifecycle::new();

    let identity = match authenticate(&state, token.as_deref()).await {
        Ok(identity) => identity,
        Err(reason) => {
            lifecycle.advance(ConnectionState::Closed);
            reject(socket, reason).await;
            return;
        }
    };
    lifecycle.advance(ConnectionState::Authenticated);

    let (tx, rx) = mpsc::channel(state.outbound_buffer.max(1));
    let handle = ConnectionHandle::new(identity.user_id, tx);

    // 欢迎消息先入队，保证它是连接收到的第一条事件
    handle.deliver(ServerEvent::Connected {
        user_id: identity.user_id,
    });

    let rooms = seed_rooms(&identity);
    let room_count = rooms.len();
    if let Some(previous) = state.registry.register(handle.clone(), rooms).await {
        info!(
            user_id = %identity.user_id,
            connection_id = %previous.connection_id,
            "closing superseded websocket connection"
        );
        previous.close();
    }
    lifecycle.advance(ConnectionState::Open);
    info!(
        user_id = %identity.user_id,
        connection_id = %handle.connection_id,
        rooms = room_count,
        "websocket connection opened"
    );

    let (sink, stream) = socket.split();
    let mut send_task = tokio::spawn(write_loop(sink, rx, handle.shutdown_token()));
    let mut recv_task = tokio::spawn(read_loop(stream, handle.clone()));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let removed = state.registry.unregister(&handle).await;
    handle.close();
    lifecycle.advance(ConnectionState::Closed);
    info!(
        user_id = %identity.user_id,
        connection_id = %handle.connection_id,
        removed,
        "websocket connection closed"
    );
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let close = sink.send(close_message(CloseReason::Superseded));
                if tokio::time::timeout(CLOSE_SEND_TIMEOUT, close).await.is_err() {
                    debug!("timed out sending close frame");
                }
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        error!(error = %err, kind = event.kind(), "failed to serialize server event");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %err, "websocket send failed");
                    break;
                }
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, handle: ConnectionHandle) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_text(&handle, text.as_str()),
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %handle.connection_id, "ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            // 协议层 ping/pong 由 axum 自动应答
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                debug!(connection_id = %handle.connection_id, error = %err, "websocket receive failed");
                break;
            }
        }
    }
}

fn handle_text(handle: &ConnectionHandle, text: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(connection_id = %handle.connection_id, error = %err, "invalid websocket message");
            return;
        }
    };

    match ClientMessage::from(envelope) {
        ClientMessage::Ping => {
            if handle.deliver(ServerEvent::Pong {}) == Delivery::BufferFull {
                warn!(connection_id = %handle.connection_id, "outbound buffer full, pong dropped");
            }
        }
        ClientMessage::Unknown(kind) => {
            warn!(connection_id = %handle.connection_id, kind = %kind, "unknown websocket message type");
        }
    }
}
