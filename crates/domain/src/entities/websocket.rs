//! WebSocket相关实体
//!
//! 定义房间、连接状态机、连接句柄以及实时消息信封。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::entities::user::Identity;
use crate::value_objects::{CommunityId, ConnectionId, PostId, UserId};

/// WebSocket 关闭码：策略违规
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket 关闭码：正常关闭
pub const CLOSE_NORMAL: u16 = 1000;

/// 房间：对某类事件感兴趣的身份集合的名字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// `user:<id>`，个人房间
    User(UserId),
    /// `community:<id>`
    Community(CommunityId),
    /// `post:<id>`，由外部层动态加入/离开
    Post(PostId),
    /// `role:moderator`，版主与管理员
    Moderators,
}

impl Room {
    /// 是否属于连接时播种的房间
    pub fn is_seeded(&self) -> bool {
        !matches!(self, Room::Post(_))
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{id}"),
            Room::Community(id) => write!(f, "community:{id}"),
            Room::Post(id) => write!(f, "post:{id}"),
            Room::Moderators => write!(f, "role:moderator"),
        }
    }
}

/// 连接建立时播种的房间：个人房间、每个所属社区，以及版主房间
pub fn seed_rooms(identity: &Identity) -> Vec<Room> {
    let mut rooms = Vec::with_capacity(identity.communities.len() + 2);
    rooms.push(Room::User(identity.user_id));
    rooms.extend(identity.communities.iter().copied().map(Room::Community));
    if identity.can_moderate() {
        rooms.push(Room::Moderators);
    }
    rooms
}

/// 连接状态机：`Connecting -> Authenticated -> Open -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Open,
    Closed,
}

impl ConnectionState {
    /// 推进到下一个状态；`Closed` 为终态
    pub fn advance(self, next: ConnectionState) -> Result<ConnectionState, RealtimeError> {
        use ConnectionState::*;

        match (self, next) {
            (Connecting, Authenticated)
            | (Connecting, Closed)
            | (Authenticated, Open)
            | (Authenticated, Closed)
            | (Open, Closed) => Ok(next),
            (from, to) => Err(RealtimeError::InvalidTransition { from, to }),
        }
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 握手未携带令牌
    MissingToken,
    /// 令牌校验失败
    InvalidToken,
    /// 令牌主体在目录中不存在
    UnknownIdentity,
    /// 同一身份建立了更新的连接
    Superseded,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Superseded => CLOSE_NORMAL,
            _ => CLOSE_POLICY_VIOLATION,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::MissingToken => "Authentication required",
            CloseReason::InvalidToken => "Authentication failed",
            CloseReason::UnknownIdentity => "Invalid user",
            CloseReason::Superseded => "Superseded by a newer connection",
        }
    }
}

/// 服务器推送的消息，序列化为 `{type, payload}` 信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    /// 欢迎消息
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// 心跳回应
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "post.created")]
    PostCreated(Value),
    #[serde(rename = "comment.created")]
    CommentCreated(Value),
    #[serde(rename = "poll.tally", rename_all = "camelCase")]
    PollTally { post_id: PostId, tally: Value },
    #[serde(rename = "notification")]
    Notification(Value),
    #[serde(rename = "report.opened")]
    ReportOpened(Value),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Pong {} => "pong",
            ServerEvent::PostCreated(_) => "post.created",
            ServerEvent::CommentCreated(_) => "comment.created",
            ServerEvent::PollTally { .. } => "poll.tally",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::ReportOpened(_) => "report.opened",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// 客户端发来的原始信封
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// 客户端消息
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// 心跳
    Ping,
    /// 未知类型，记录后忽略
    Unknown(String),
}

impl From<ClientEnvelope> for ClientMessage {
    fn from(envelope: ClientEnvelope) -> Self {
        match envelope.kind.as_str() {
            "ping" => ClientMessage::Ping,
            _ => ClientMessage::Unknown(envelope.kind),
        }
    }
}

/// 单次投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// 出站缓冲已满，消息被丢弃
    BufferFull,
    /// 连接已关闭，消息被丢弃
    Closed,
}

/// 已打开连接的句柄
///
/// 注册表只保存句柄；写套接字的是连接自己的写循环，句柄只向其有界通道入队。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    sender: mpsc::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            connection_id: ConnectionId::random(),
            user_id,
            sender,
            shutdown: CancellationToken::new(),
        }
    }

    /// 非阻塞入队
    pub fn deliver(&self, event: ServerEvent) -> Delivery {
        if self.shutdown.is_cancelled() {
            return Delivery::Closed;
        }
        match self.sender.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::BufferFull,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// 请求写循环关闭连接，可重复调用
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// 实时层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("connection rejected: {}", .0.description())]
    ConnectionRejected(CloseReason),
    #[error("invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
