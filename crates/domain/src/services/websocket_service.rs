//! 连接注册表接口
//!
//! 每个身份最多一个打开的连接；房间成员关系只在注册表内维护。

use async_trait::async_trait;

use crate::entities::websocket::{ConnectionHandle, Room};
use crate::value_objects::UserId;

/// 注册表统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub rooms: usize,
}

/// 连接注册表
///
/// 所有方法对并发调用安全；查询返回快照，调用方持有期间注册表可以继续变化。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// 注册连接并加入给定房间
    ///
    /// 若该身份已有连接，旧连接被替换并返回，调用方负责关闭它。
    async fn register(&self, handle: ConnectionHandle, rooms: Vec<Room>)
        -> Option<ConnectionHandle>;

    /// 注销连接并移出所有房间
    ///
    /// 只有当注册表中的连接仍是 `handle` 时才会移除，返回是否移除。
    async fn unregister(&self, handle: &ConnectionHandle) -> bool;

    /// 将已连接的身份加入房间，返回成员关系是否发生变化
    async fn join(&self, user_id: UserId, room: Room) -> bool;

    /// 将身份移出房间，返回成员关系是否发生变化
    async fn leave(&self, user_id: UserId, room: Room) -> bool;

    async fn connection(&self, user_id: UserId) -> Option<ConnectionHandle>;

    /// 房间内所有连接的快照
    async fn room_members(&self, room: Room) -> Vec<ConnectionHandle>;

    async fn all_connections(&self) -> Vec<ConnectionHandle>;

    async fn rooms_of(&self, user_id: UserId) -> Vec<Room>;

    async fn stats(&self) -> RegistryStats;
}
