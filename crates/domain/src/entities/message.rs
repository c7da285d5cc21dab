//! 聊天消息实体
//!
//! 消息要么发往房间（`room_id`），要么是私聊（`receiver_id`），
//! 两者必须恰好设置其一。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, RoomId, UserId};

/// 消息内容长度上限（清洗后）
pub const MAX_CONTENT_LEN: usize = 2000;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    System,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

/// 待持久化的新消息
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: Option<RoomId>,
    pub receiver_id: Option<UserId>,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
}

/// 已持久化的聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: Option<RoomId>,
    pub receiver_id: Option<UserId>,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// 从新消息构造，内容须已经过清洗
    pub fn from_new(new: NewMessage) -> DomainResult<Self> {
        if new.content.is_empty() {
            return Err(DomainError::validation_error("content", "cannot be empty"));
        }
        if new.content.chars().count() > MAX_CONTENT_LEN {
            return Err(DomainError::validation_error("content", "too long"));
        }
        match (&new.room_id, &new.receiver_id) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(DomainError::validation_error(
                    "target",
                    "exactly one of room_id and receiver_id must be set",
                ));
            }
        }

        Ok(Self {
            id: MessageId::generate(),
            room_id: new.room_id,
            receiver_id: new.receiver_id,
            sender_id: new.sender_id,
            sender_name: new.sender_name,
            content: new.content,
            kind: new.kind,
            created_at: Utc::now(),
        })
    }

    pub fn is_direct(&self) -> bool {
        self.receiver_id.is_some()
    }
}
