//! 房间生命周期事件
//!
//! 事件通过进程内广播通道发布，由路由层翻译成
//! 推送给客户端的协议帧。事件本身不做持久化。

use serde::{Deserialize, Serialize};

use crate::entities::Room;
use crate::value_objects::{RoomId, UserId};

/// 房间生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomLifecycleEvent {
    /// 房间已创建
    RoomCreated { room: Room },

    /// 房间属性已更新
    RoomUpdated { room: Room },

    /// 房间已删除
    RoomDeleted { room_id: RoomId },

    /// 用户加入房间
    UserJoinedRoom {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },

    /// 用户离开房间
    UserLeftRoom {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },
}

impl RoomLifecycleEvent {
    /// 事件涉及的房间
    pub fn room_id(&self) -> &RoomId {
        match self {
            RoomLifecycleEvent::RoomCreated { room } => &room.id,
            RoomLifecycleEvent::RoomUpdated { room } => &room.id,
            RoomLifecycleEvent::RoomDeleted { room_id } => room_id,
            RoomLifecycleEvent::UserJoinedRoom { room_id, .. } => room_id,
            RoomLifecycleEvent::UserLeftRoom { room_id, .. } => room_id,
        }
    }

    /// 事件类型名，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            RoomLifecycleEvent::RoomCreated { .. } => "room_created",
            RoomLifecycleEvent::RoomUpdated { .. } => "room_updated",
            RoomLifecycleEvent::RoomDeleted { .. } => "room_deleted",
            RoomLifecycleEvent::UserJoinedRoom { .. } => "user_joined_room",
            RoomLifecycleEvent::UserLeftRoom { .. } => "user_left_room",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_room_id() {
        let event = RoomLifecycleEvent::UserJoinedRoom {
            room_id: RoomId::general(),
            user_id: UserId::generate(),
            username: "alice".to_string(),
        };
        assert!(event.room_id().is_general());
        assert_eq!(event.kind(), "user_joined_room");
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = RoomLifecycleEvent::RoomDeleted {
            room_id: RoomId::parse("lobby").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "roomDeleted");
        assert_eq!(json["roomId"], "lobby");
    }
}
