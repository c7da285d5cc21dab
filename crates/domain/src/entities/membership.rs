//! 房间成员关系

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{RoomId, UserId};

/// 用户与房间的成员关系记录
///
/// 成员关系是持久的：断开连接或切换房间不会移除成员身份，
/// 只有显式退出或房间被删除才会移除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMembership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

impl RoomMembership {
    pub fn new(room_id: RoomId, user_id: UserId) -> Self {
        Self {
            room_id,
            user_id,
            joined_at: Utc::now(),
        }
    }
}
