//! 连接层协议定义
//!
//! 入站与出站事件都是内部标签的 JSON 枚举（`type` 字段区分）。
//! 入站载荷在边界处按此模式反序列化，形状不符直接拒绝，
//! 不会把未校验的数据递给协调层。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use domain::{Message, MessageKind, Room, RoomId, User, UserId, UserRole};

use crate::error::ChatError;

/// 注册表和快照里携带的用户摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub role: UserRole,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }
}

/// 客户端入站事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// 认证，必须是连接上的第一个业务事件
    Authenticate { token: String },

    /// 加入房间，私有房间可附带密码
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        password: Option<String>,
    },

    /// 离开房间
    LeaveRoom { room_id: RoomId },

    /// 发送消息：房间消息设 `roomId`，私聊设 `receiverId`。
    ///
    /// 消息类型的线上字段名是 `kind`：外层信封的 `type` 已被
    /// 事件标签占用，内部标签枚举不能再携带同名字段。
    Message {
        content: String,
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        receiver_id: Option<UserId>,
        #[serde(default)]
        kind: MessageKind,
    },

    /// 输入状态指示，不持久化也不限流
    Typing { is_typing: bool },

    /// 广播房间：申请发言
    RequestMic { room_id: RoomId },

    /// 广播房间：主持人批准发言
    ApproveMic { room_id: RoomId, user_id: UserId },

    /// 广播房间：主持人拒绝申请
    RejectMic { room_id: RoomId, user_id: UserId },

    /// 广播房间：主持人移除发言者
    RemoveSpeaker { room_id: RoomId, user_id: UserId },

    /// 心跳
    Ping,
}

/// 服务端出站事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user: UserSummary,
    },

    Error {
        code: String,
        message: String,
    },

    /// 加入成功，附带房间信息和当前在线成员快照
    RoomJoined {
        room: Room,
        online_users: Vec<UserSummary>,
    },

    UserJoinedRoom {
        user_id: UserId,
        username: String,
        room_id: RoomId,
    },

    UserLeftRoom {
        user_id: UserId,
        username: String,
        room_id: RoomId,
    },

    RoomCreated {
        room: Room,
    },

    RoomUpdated {
        room: Room,
    },

    RoomDeleted {
        room_id: RoomId,
    },

    NewMessage {
        message: Message,
    },

    UserTyping {
        user_id: UserId,
        username: String,
        is_typing: bool,
        room_id: RoomId,
    },

    MicRequested {
        user_id: UserId,
        room_id: RoomId,
    },

    MicApproved {
        user_id: UserId,
        room_id: RoomId,
    },

    MicRejected {
        user_id: UserId,
        room_id: RoomId,
    },

    SpeakerRemoved {
        user_id: UserId,
        room_id: RoomId,
    },

    Kicked {
        reason: String,
    },

    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// 把应用错误翻译成 `error` 事件
    pub fn from_error(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
