//! 广播房间的轮流发言控制
//!
//! 每个用户的状态机：空闲 → 排队 → 发言，或被拒绝/移除回到空闲。
//! 队列与发言者集合的完整性由 `domain::Room` 的方法保证；
//! 这里只负责把每次变更包成目录写锁内的原子单元。
//! 调用者（会话协调层）负责主持人/管理员的权限校验。

use std::sync::Arc;

use tracing::info;

use domain::{Room, RoomId, UserId};

use crate::error::{ChatError, ChatResult};
use crate::room_directory::RoomDirectory;

/// 发言控制器
pub struct MicController {
    directory: Arc<RoomDirectory>,
}

impl MicController {
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self { directory }
    }

    fn ensure_broadcast(room: &Room) -> ChatResult<()> {
        if !room.is_broadcast {
            return Err(ChatError::NotBroadcastRoom(room.id.clone()));
        }
        Ok(())
    }

    /// 申请发言，FIFO 入队；已排队或已在发言时返回 `false`
    pub async fn request_mic(&self, room_id: &RoomId, user_id: UserId) -> ChatResult<bool> {
        let (_, queued) = self
            .directory
            .update_broadcast_state(room_id, |room| {
                Self::ensure_broadcast(room)?;
                Ok(room.request_mic(user_id))
            })
            .await?;
        if queued {
            info!(user_id = %user_id, room_id = %room_id, "mic requested");
        }
        Ok(queued)
    }

    /// 批准发言：出队并加入发言者集合，幂等
    pub async fn approve(&self, room_id: &RoomId, user_id: UserId) -> ChatResult<bool> {
        let (_, added) = self
            .directory
            .update_broadcast_state(room_id, |room| {
                Self::ensure_broadcast(room)?;
                Ok(room.approve_mic(user_id))
            })
            .await?;
        if added {
            info!(user_id = %user_id, room_id = %room_id, "mic approved");
        }
        Ok(added)
    }

    /// 拒绝申请：只出队
    pub async fn reject(&self, room_id: &RoomId, user_id: UserId) -> ChatResult<bool> {
        let (_, removed) = self
            .directory
            .update_broadcast_state(room_id, |room| {
                Self::ensure_broadcast(room)?;
                Ok(room.reject_mic(user_id))
            })
            .await?;
        if removed {
            info!(user_id = %user_id, room_id = %room_id, "mic request rejected");
        }
        Ok(removed)
    }

    /// 移除发言者
    pub async fn remove_speaker(&self, room_id: &RoomId, user_id: UserId) -> ChatResult<bool> {
        let (_, removed) = self
            .directory
            .update_broadcast_state(room_id, |room| {
                Self::ensure_broadcast(room)?;
                Ok(room.remove_speaker(user_id))
            })
            .await?;
        if removed {
            info!(user_id = %user_id, room_id = %room_id, "speaker removed");
        }
        Ok(removed)
    }
}
