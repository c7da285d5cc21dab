//! 房间目录：房间元数据与成员关系的权威内存视图
//!
//! 缓存的唯一写入者。持久层先写、缓存后提交：任何落库失败
//! 都不会在缓存里留下乐观更新。每次状态变更都在广播通道上
//! 发布一条生命周期事件，路由层订阅后负责推送。
//! 广播房间的发言状态变更通过 [`RoomDirectory::update_broadcast_state`]
//! 在写锁内完成"出队 + 入发言者集合"这一原子单元。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use domain::{
    ChatStore, RepositoryError, Room, RoomLifecycleEvent, RoomMembership, RoomId, RoomSpec,
    RoomPatch, UserId,
};

use crate::connection_registry::ConnectionRegistry;
use crate::error::{ChatError, ChatResult};
use crate::protocol::UserSummary;

/// 生命周期事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 房间列表过滤条件
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomFilter {
    /// 包含已停用的房间
    pub include_inactive: bool,
    /// 只要广播房间
    pub only_broadcast: bool,
}

/// 运行时房间统计
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub total_rooms: usize,
    pub active_rooms: usize,
    pub broadcast_rooms: usize,
    pub online_users: usize,
    pub connections: usize,
}

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, Room>,
    /// 按加入顺序缓存的成员列表
    members: HashMap<RoomId, Vec<UserId>>,
}

/// 房间目录
pub struct RoomDirectory {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    state: RwLock<DirectoryState>,
    events: broadcast::Sender<RoomLifecycleEvent>,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn ChatStore>, registry: Arc<ConnectionRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            registry,
            state: RwLock::new(DirectoryState::default()),
            events,
        }
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<RoomLifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RoomLifecycleEvent) {
        // 没有订阅者不算错误
        let _ = self.events.send(event);
    }

    /// 启动时从持久层预热缓存，并确保默认房间存在
    pub async fn load_rooms(&self) -> ChatResult<usize> {
        let rooms = self.store.list_rooms().await?;
        let mut state = self.state.write().await;

        for room in &rooms {
            let members = self.store.list_members(&room.id).await?;
            state.members.insert(room.id.clone(), members);
            state.rooms.insert(room.id.clone(), room.clone());
        }

        if !state.rooms.contains_key(&RoomId::general()) {
            let general = Room::general(UserId::new(uuid::Uuid::nil()));
            self.store.create_room(&general).await?;
            state.members.insert(general.id.clone(), Vec::new());
            state.rooms.insert(general.id.clone(), general);
            info!("general room created");
        }

        let loaded = state.rooms.len();
        info!(rooms = loaded, "room directory warmed up");
        Ok(loaded)
    }

    pub async fn get_room(&self, room_id: &RoomId) -> ChatResult<Room> {
        if let Some(room) = self.state.read().await.rooms.get(room_id) {
            return Ok(room.clone());
        }
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;
        self.state
            .write()
            .await
            .rooms
            .insert(room_id.clone(), room.clone());
        Ok(room)
    }

    pub async fn list_rooms(&self, filter: RoomFilter) -> Vec<Room> {
        let state = self.state.read().await;
        let mut rooms: Vec<Room> = state
            .rooms
            .values()
            .filter(|room| filter.include_inactive || room.is_active)
            .filter(|room| !filter.only_broadcast || room.is_broadcast)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        rooms
    }

    /// 创建房间，仅限管理员/所有者
    pub async fn create_room(&self, spec: RoomSpec, actor: &UserSummary) -> ChatResult<Room> {
        if !actor.role.can_create_rooms() {
            return Err(ChatError::PermissionDenied);
        }
        let room = Room::create(spec, actor.id)?;

        let mut state = self.state.write().await;
        if state.rooms.contains_key(&room.id) {
            return Err(ChatError::DuplicateRoom(room.id.clone()));
        }
        self.store.create_room(&room).await.map_err(|err| match err {
            RepositoryError::Conflict { .. } => ChatError::DuplicateRoom(room.id.clone()),
            other => other.into(),
        })?;

        state.members.insert(room.id.clone(), Vec::new());
        state.rooms.insert(room.id.clone(), room.clone());
        drop(state);

        info!(room_id = %room.id, actor = %actor.id, "room created");
        self.emit(RoomLifecycleEvent::RoomCreated { room: room.clone() });
        Ok(room)
    }

    /// 更新房间属性，创建者或特权用户
    pub async fn update_room(
        &self,
        room_id: &RoomId,
        patch: RoomPatch,
        actor: &UserSummary,
    ) -> ChatResult<Room> {
        let mut state = self.state.write().await;
        let mut room = match state.rooms.get(room_id) {
            Some(room) => room.clone(),
            None => self
                .store
                .get_room(room_id)
                .await?
                .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?,
        };
        if room.created_by != actor.id && !actor.role.is_privileged() {
            return Err(ChatError::PermissionDenied);
        }

        room.apply_patch(patch)?;
        self.store.update_room(&room).await?;
        state.rooms.insert(room_id.clone(), room.clone());
        drop(state);

        info!(room_id = %room_id, actor = %actor.id, "room updated");
        self.emit(RoomLifecycleEvent::RoomUpdated { room: room.clone() });
        Ok(room)
    }

    /// 删除房间并级联：清成员关系、把在场连接移到"无房间"、清缓存
    pub async fn delete_room(&self, room_id: &RoomId, actor: &UserSummary) -> ChatResult<()> {
        if room_id.is_general() {
            return Err(ChatError::ProtectedRoom);
        }

        let mut state = self.state.write().await;
        let room = match state.rooms.get(room_id) {
            Some(room) => room.clone(),
            None => self
                .store
                .get_room(room_id)
                .await?
                .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?,
        };
        if room.created_by != actor.id && !actor.role.is_privileged() {
            return Err(ChatError::PermissionDenied);
        }

        self.store.delete_room(room_id).await?;
        state.rooms.remove(room_id);
        state.members.remove(room_id);
        drop(state);

        let detached = self.registry.detach_room(room_id);
        info!(
            room_id = %room_id,
            actor = %actor.id,
            detached = detached.len(),
            "room deleted"
        );
        self.emit(RoomLifecycleEvent::RoomDeleted {
            room_id: room_id.clone(),
        });
        Ok(())
    }

    /// 加入房间
    ///
    /// 默认房间缺失时自动补建。已是成员时幂等成功。
    /// 容量以持久层成员数为准。
    pub async fn join(
        &self,
        user: &UserSummary,
        room_id: &RoomId,
        password: Option<&str>,
    ) -> ChatResult<Room> {
        let mut state = self.state.write().await;

        let room = match state.rooms.get(room_id) {
            Some(room) => room.clone(),
            None => match self.store.get_room(room_id).await? {
                Some(room) => {
                    state.rooms.insert(room_id.clone(), room.clone());
                    room
                }
                None if room_id.is_general() => {
                    let general = Room::general(UserId::new(uuid::Uuid::nil()));
                    self.store.create_room(&general).await?;
                    state.members.insert(general.id.clone(), Vec::new());
                    state.rooms.insert(general.id.clone(), general.clone());
                    general
                }
                None => return Err(ChatError::RoomNotFound(room_id.clone())),
            },
        };

        if !room.is_active {
            return Err(ChatError::RoomNotFound(room_id.clone()));
        }
        if room.is_private && room.created_by != user.id && !user.role.is_privileged() {
            let password_ok = matches!(
                (&room.password, password),
                (Some(expected), Some(given)) if expected == given
            );
            if !password_ok {
                return Err(ChatError::AccessDenied);
            }
        }

        if self.store.is_member(room_id, user.id).await? {
            drop(state);
            // 重连场景：成员关系已存在，只重新广播在场通知
            self.emit(RoomLifecycleEvent::UserJoinedRoom {
                room_id: room_id.clone(),
                user_id: user.id,
                username: user.username.clone(),
            });
            return Ok(room);
        }

        if room.is_full(self.store.member_count(room_id).await?) {
            return Err(ChatError::CapacityExceeded);
        }

        let membership = RoomMembership::new(room_id.clone(), user.id);
        self.store.add_membership(&membership).await?;
        state
            .members
            .entry(room_id.clone())
            .or_default()
            .push(user.id);
        drop(state);

        info!(user_id = %user.id, room_id = %room_id, "user joined room");
        self.emit(RoomLifecycleEvent::UserJoinedRoom {
            room_id: room_id.clone(),
            user_id: user.id,
            username: user.username.clone(),
        });
        Ok(room)
    }

    /// 离开房间，幂等：不是成员时为成功空操作
    pub async fn leave(&self, user: &UserSummary, room_id: &RoomId) -> ChatResult<bool> {
        if room_id.is_general() {
            return Err(ChatError::ProtectedRoom);
        }

        let mut state = self.state.write().await;
        let removed = self.store.remove_membership(room_id, user.id).await?;
        if let Some(members) = state.members.get_mut(room_id) {
            members.retain(|id| *id != user.id);
        }
        drop(state);

        if removed {
            info!(user_id = %user.id, room_id = %room_id, "user left room");
            self.emit(RoomLifecycleEvent::UserLeftRoom {
                room_id: room_id.clone(),
                user_id: user.id,
                username: user.username.clone(),
            });
        }
        Ok(removed)
    }

    /// 房间成员（持久成员关系，不是在线状态）
    pub async fn members_of(&self, room_id: &RoomId) -> ChatResult<Vec<UserId>> {
        if let Some(members) = self.state.read().await.members.get(room_id) {
            return Ok(members.clone());
        }
        let members = self.store.list_members(room_id).await?;
        self.state
            .write()
            .await
            .members
            .insert(room_id.clone(), members.clone());
        Ok(members)
    }

    /// 用户所属的全部房间（基于已预热的缓存）
    pub async fn rooms_of(&self, user_id: UserId) -> Vec<RoomId> {
        let state = self.state.read().await;
        let mut rooms: Vec<RoomId> = state
            .members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(room_id, _)| room_id.clone())
            .collect();
        rooms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        rooms
    }

    /// 在写锁内对广播房间的发言状态执行一次原子变更
    ///
    /// 闭包修改房间后先落库，成功才提交缓存并返回闭包结果。
    pub async fn update_broadcast_state<T, F>(&self, room_id: &RoomId, f: F) -> ChatResult<(Room, T)>
    where
        F: FnOnce(&mut Room) -> ChatResult<T>,
    {
        let mut state = self.state.write().await;
        let mut room = match state.rooms.get(room_id) {
            Some(room) => room.clone(),
            None => self
                .store
                .get_room(room_id)
                .await?
                .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?,
        };

        let value = f(&mut room)?;
        if let Err(err) = self.store.update_room(&room).await {
            warn!(room_id = %room_id, error = %err, "broadcast state write failed");
            return Err(err.into());
        }
        state.rooms.insert(room_id.clone(), room.clone());
        Ok((room, value))
    }

    /// 丢弃某房间的缓存条目，下次读取回源
    pub async fn invalidate(&self, room_id: &RoomId) {
        let mut state = self.state.write().await;
        state.rooms.remove(room_id);
        state.members.remove(room_id);
    }

    /// 运行时统计，供健康检查使用
    pub async fn stats(&self) -> RoomStats {
        let state = self.state.read().await;
        RoomStats {
            total_rooms: state.rooms.len(),
            active_rooms: state.rooms.values().filter(|r| r.is_active).count(),
            broadcast_rooms: state.rooms.values().filter(|r| r.is_broadcast).count(),
            online_users: self.registry.online_user_count(),
            connections: self.registry.connection_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use domain::{MockChatStore, RoomSpec, UserRole};

    use crate::connection_registry::RegistryConfig;

    fn admin() -> UserSummary {
        UserSummary {
            id: UserId::generate(),
            username: "admin".to_string(),
            role: UserRole::Admin,
        }
    }

    fn directory_with(store: MockChatStore) -> RoomDirectory {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        RoomDirectory::new(Arc::new(store), registry)
    }

    #[tokio::test]
    async fn test_failed_create_leaves_cache_empty() {
        let mut store = MockChatStore::new();
        store
            .expect_create_room()
            .returning(|_| Err(RepositoryError::QueryError("disk full".to_string())));
        let directory = directory_with(store);

        let spec = RoomSpec::new(RoomId::parse("lobby").unwrap(), "Lobby");
        let err = directory.create_room(spec, &admin()).await.unwrap_err();
        assert!(matches!(err, ChatError::Internal(_)));

        // 落库失败不留乐观缓存
        let filter = RoomFilter {
            include_inactive: true,
            only_broadcast: false,
        };
        assert!(directory.list_rooms(filter).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_membership_write_leaves_cache_unchanged() {
        let mut store = MockChatStore::new();
        store.expect_create_room().returning(|_| Ok(()));
        store.expect_is_member().returning(|_, _| Ok(false));
        store.expect_member_count().returning(|_| Ok(0));
        store
            .expect_add_membership()
            .returning(|_| Err(RepositoryError::ConnectionError("timeout".to_string())));
        let directory = directory_with(store);

        let actor = admin();
        let room = directory
            .create_room(RoomSpec::new(RoomId::parse("side").unwrap(), "Side"), &actor)
            .await
            .unwrap();

        let err = directory.join(&actor, &room.id, None).await.unwrap_err();
        assert!(matches!(err, ChatError::Internal(_)));
        assert!(directory.members_of(&room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_broadcast_write_keeps_previous_state() {
        let mut store = MockChatStore::new();
        store.expect_create_room().returning(|_| Ok(()));
        store
            .expect_update_room()
            .returning(|_| Err(RepositoryError::ConnectionError("timeout".to_string())));
        let directory = directory_with(store);

        let actor = admin();
        let mut spec = RoomSpec::new(RoomId::parse("onair").unwrap(), "On Air");
        spec.is_broadcast = true;
        spec.host_id = Some(actor.id);
        let room = directory.create_room(spec, &actor).await.unwrap();

        let speaker = UserId::generate();
        let err = directory
            .update_broadcast_state(&room.id, |room| Ok(room.request_mic(speaker)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Internal(_)));

        // 缓存保持落库前的状态
        let cached = directory.get_room(&room.id).await.unwrap();
        assert!(cached.speak_queue.is_empty());
    }
}
