//! 内存连接注册表
//!
//! 身份到连接的映射和房间成员关系放在同一把锁下，
//! 注册、注销、加入、离开对并发的扇出读取是原子的。

use async_trait::async_trait;
use domain::{ConnectionHandle, ConnectionRegistry, RegistryStats, Room, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct RegistryEntry {
    handle: ConnectionHandle,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<UserId, RegistryEntry>,
    rooms: HashMap<Room, HashSet<UserId>>,
}

impl RegistryState {
    fn add_member(&mut self, room: Room, user_id: UserId) -> bool {
        self.rooms.entry(room).or_default().insert(user_id)
    }

    /// 移出房间，成员为空时删除房间
    fn remove_member(&mut self, room: &Room, user_id: &UserId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(user_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn detach(&mut self, user_id: &UserId) -> Option<RegistryEntry> {
        let entry = self.connections.remove(user_id)?;
        for room in &entry.rooms {
            self.remove_member(room, user_id);
        }
        Some(entry)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn register(
        &self,
        handle: ConnectionHandle,
        rooms: Vec<Room>,
    ) -> Option<ConnectionHandle> {
        let user_id = handle.user_id;
        let connection_id = handle.connection_id;
        let mut state = self.state.write().await;

        let superseded = state.detach(&user_id).map(|entry| entry.handle);
        let rooms: HashSet<Room> = rooms.into_iter().collect();
        for room in &rooms {
            state.add_member(*room, user_id);
        }
        let room_count = rooms.len();
        state
            .connections
            .insert(user_id, RegistryEntry { handle, rooms });
        drop(state);

        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            rooms = room_count,
            superseded = superseded.is_some(),
            "connection registered"
        );
        superseded
    }

    async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut state = self.state.write().await;
        let current = state
            .connections
            .get(&handle.user_id)
            .map(|entry| entry.handle.connection_id);
        if current != Some(handle.connection_id) {
            return false;
        }
        state.detach(&handle.user_id);
        drop(state);

        info!(
            user_id = %handle.user_id,
            connection_id = %handle.connection_id,
            "connection unregistered"
        );
        true
    }

    async fn join(&self, user_id: UserId, room: Room) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&user_id) else {
            debug!(user_id = %user_id, room = %room, "join ignored, no live connection");
            return false;
        };
        if !entry.rooms.insert(room) {
            return false;
        }
        state.add_member(room, user_id);
        debug!(user_id = %user_id, room = %room, "joined room");
        true
    }

    async fn leave(&self, user_id: UserId, room: Room) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&user_id) else {
            return false;
        };
        if !entry.rooms.remove(&room) {
            return false;
        }
        state.remove_member(&room, &user_id);
        debug!(user_id = %user_id, room = %room, "left room");
        true
    }

    async fn connection(&self, user_id: UserId) -> Option<ConnectionHandle> {
        let state = self.state.read().await;
        state
            .connections
            .get(&user_id)
            .map(|entry| entry.handle.clone())
    }

    async fn room_members(&self, room: Room) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|user_id| state.connections.get(user_id))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    async fn all_connections(&self) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    async fn rooms_of(&self, user_id: UserId) -> Vec<Room> {
        let state = self.state.read().await;
        state
            .connections
            .get(&user_id)
            .map(|entry| entry.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        RegistryStats {
            connections: state.connections.len(),
            rooms: state.rooms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CommunityId, PostId, ServerEvent};
    use tokio::sync::mpsc;

    fn handle(user_id: UserId) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(user_id, tx), rx)
    }

    #[tokio::test]
    async fn test_register_seeds_rooms_and_unregister_prunes_them() {
        let registry = InMemoryConnectionRegistry::new();
        let user_id = UserId::random();
        let community = Room::Community(CommunityId::random());
        let (conn, _rx) = handle(user_id);

        assert!(registry
            .register(conn.clone(), vec![Room::User(user_id), community])
            .await
            .is_none());
        assert_eq!(registry.room_members(community).await.len(), 1);
        assert_eq!(
            registry.stats().await,
            RegistryStats {
                connections: 1,
                rooms: 2
            }
        );

        assert!(registry.unregister(&conn).await);
        assert!(registry.room_members(community).await.is_empty());
        assert!(registry.rooms_of(user_id).await.is_empty());
        assert_eq!(registry.stats().await, RegistryStats::default());
        assert!(!registry.unregister(&conn).await);
    }

    #[tokio::test]
    async fn test_second_connection_supersedes_first() {
        let registry = InMemoryConnectionRegistry::new();
        let user_id = UserId::random();
        let room = Room::User(user_id);
        let (first, _rx1) = handle(user_id);
        let (second, _rx2) = handle(user_id);

        registry.register(first.clone(), vec![room]).await;
        let superseded = registry.register(second.clone(), vec![room]).await;
        assert_eq!(
            superseded.map(|h| h.connection_id),
            Some(first.connection_id)
        );

        let members = registry.room_members(room).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].connection_id, second.connection_id);

        // 旧连接关闭时不能移除新连接
        assert!(!registry.unregister(&first).await);
        assert_eq!(
            registry.connection(user_id).await.map(|h| h.connection_id),
            Some(second.connection_id)
        );
    }

    #[tokio::test]
    async fn test_join_and_leave_are_idempotent() {
        let registry = InMemoryConnectionRegistry::new();
        let user_id = UserId::random();
        let post = Room::Post(PostId::random());
        let (conn, _rx) = handle(user_id);

        assert!(!registry.join(user_id, post).await);

        registry.register(conn.clone(), vec![Room::User(user_id)]).await;
        assert!(registry.join(user_id, post).await);
        assert!(!registry.join(user_id, post).await);
        assert_eq!(registry.room_members(post).await.len(), 1);

        assert!(registry.leave(user_id, post).await);
        assert!(!registry.leave(user_id, post).await);
        assert!(registry.room_members(post).await.is_empty());
        assert_eq!(registry.stats().await.rooms, 1);

        registry.join(user_id, post).await;
        registry.unregister(&conn).await;
        assert!(registry.room_members(post).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_keeps_rooms_consistent() {
        let registry = InMemoryConnectionRegistry::new();
        let community = Room::Community(CommunityId::random());
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let user_id = UserId::random();
                let (tx, _rx) = mpsc::channel(1);
                let conn = ConnectionHandle::new(user_id, tx);
                registry
                    .register(conn.clone(), vec![Room::User(user_id), community])
                    .await;
                registry.room_members(community).await;
                registry.unregister(&conn).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(registry.stats().await, RegistryStats::default());
    }
}
