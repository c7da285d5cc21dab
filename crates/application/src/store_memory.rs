//! 内存版持久化存储
//!
//! 开发模式和测试使用，语义与数据库实现一致：
//! 冲突、幂等、成员关系级联删除都照常生效。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use domain::{
    ChatStore, Message, RepositoryError, RepositoryResult, Room, RoomId, RoomMembership, User,
    UserId,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, Room>,
    /// 按加入顺序保存
    memberships: Vec<RoomMembership>,
    messages: Vec<Message>,
}

/// 内存存储
#[derive(Default)]
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置用户（测试/开发用）
    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    /// 已持久化的消息数（测试用）
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// 最近一条消息（测试用）
    pub async fn last_message(&self) -> Option<Message> {
        self.state.read().await.messages.last().cloned()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn get_user(&self, user_id: UserId) -> RepositoryResult<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn set_user_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
    ) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| RepositoryError::not_found("user"))?;
        user.is_online = is_online;
        Ok(())
    }

    async fn create_room(&self, room: &Room) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        if state.rooms.contains_key(&room.id) {
            return Err(RepositoryError::conflict("room"));
        }
        state.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> RepositoryResult<Option<Room>> {
        Ok(self.state.read().await.rooms.get(room_id).cloned())
    }

    async fn list_rooms(&self) -> RepositoryResult<Vec<Room>> {
        Ok(self.state.read().await.rooms.values().cloned().collect())
    }

    async fn update_room(&self, room: &Room) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&room.id) {
            return Err(RepositoryError::not_found("room"));
        }
        state.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        state.rooms.remove(room_id);
        state.memberships.retain(|m| m.room_id != *room_id);
        Ok(())
    }

    async fn add_membership(&self, membership: &RoomMembership) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let exists = state
            .memberships
            .iter()
            .any(|m| m.room_id == membership.room_id && m.user_id == membership.user_id);
        if !exists {
            state.memberships.push(membership.clone());
        }
        Ok(())
    }

    async fn remove_membership(
        &self,
        room_id: &RoomId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        let mut state = self.state.write().await;
        let before = state.memberships.len();
        state
            .memberships
            .retain(|m| !(m.room_id == *room_id && m.user_id == user_id));
        Ok(state.memberships.len() != before)
    }

    async fn is_member(&self, room_id: &RoomId, user_id: UserId) -> RepositoryResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .iter()
            .any(|m| m.room_id == *room_id && m.user_id == user_id))
    }

    async fn list_members(&self, room_id: &RoomId) -> RepositoryResult<Vec<UserId>> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.room_id == *room_id)
            .map(|m| m.user_id)
            .collect())
    }

    async fn member_count(&self, room_id: &RoomId) -> RepositoryResult<usize> {
        Ok(self.list_members(room_id).await?.len())
    }

    async fn create_message(&self, message: &Message) -> RepositoryResult<()> {
        self.state.write().await.messages.push(message.clone());
        Ok(())
    }
}
