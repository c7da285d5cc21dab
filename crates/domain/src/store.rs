//! 持久化存储接口
//!
//! 协调层只通过这个 trait 访问用户、房间、成员关系和消息。
//! 实现可以是 PostgreSQL，也可以是测试用的内存存储。

use async_trait::async_trait;
use thiserror::Error;

use crate::entities::{Message, Room, RoomMembership, User};
use crate::value_objects::{RoomId, UserId};

/// 存储层错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database connection failed: {0}")]
    ConnectionError(String),

    #[error("query failed: {0}")]
    QueryError(String),

    #[error("serialization failed: {0}")]
    SerializationError(String),

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    Conflict { resource: String },
}

impl RepositoryError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// 聊天系统的持久化存储
///
/// 写入顺序约定：先落库，成功后才允许调用方更新任何缓存。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    // ---- 用户 ----

    async fn get_user(&self, user_id: UserId) -> RepositoryResult<Option<User>>;

    async fn set_user_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
    ) -> RepositoryResult<()>;

    // ---- 房间 ----

    /// 创建房间；ID 已存在时返回 [`RepositoryError::Conflict`]
    async fn create_room(&self, room: &Room) -> RepositoryResult<()>;

    async fn get_room(&self, room_id: &RoomId) -> RepositoryResult<Option<Room>>;

    async fn list_rooms(&self) -> RepositoryResult<Vec<Room>>;

    /// 整体覆盖写入房间（含广播发言状态）
    async fn update_room(&self, room: &Room) -> RepositoryResult<()>;

    /// 删除房间及其成员关系
    async fn delete_room(&self, room_id: &RoomId) -> RepositoryResult<()>;

    // ---- 成员关系 ----

    /// 幂等地写入成员关系
    async fn add_membership(&self, membership: &RoomMembership) -> RepositoryResult<()>;

    /// 移除成员关系，返回是否实际删除了记录
    async fn remove_membership(
        &self,
        room_id: &RoomId,
        user_id: UserId,
    ) -> RepositoryResult<bool>;

    async fn is_member(&self, room_id: &RoomId, user_id: UserId) -> RepositoryResult<bool>;

    async fn list_members(&self, room_id: &RoomId) -> RepositoryResult<Vec<UserId>>;

    async fn member_count(&self, room_id: &RoomId) -> RepositoryResult<usize>;

    // ---- 消息 ----

    async fn create_message(&self, message: &Message) -> RepositoryResult<()>;
}
