//! 房间实体定义
//!
//! 房间除普通成员语义外，还承载广播房间的轮流发言状态：
//! 一个 FIFO 的发言申请队列和一个当前发言者集合。
//! 不变式：任一用户最多出现在 {队列, 发言者} 之一中，且二者内部无重复。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{RoomId, UserId};

/// 房间默认容量
pub const DEFAULT_MAX_USERS: u32 = 100;

/// 房间实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    /// 显示名称
    pub name: String,
    pub description: Option<String>,
    /// 创建者
    pub created_by: UserId,
    /// 默认房间（`general`）不可删除、不可退出
    pub is_default: bool,
    pub is_active: bool,
    /// 私有房间仅限创建者、特权用户或持有密码者加入
    pub is_private: bool,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// 成员容量上限
    pub max_users: u32,
    /// 广播房间：普通成员只能收听，发言需要申请并获主持人批准
    pub is_broadcast: bool,
    /// 广播房间主持人
    pub host_id: Option<UserId>,
    /// 发言申请队列，FIFO
    pub speak_queue: Vec<UserId>,
    /// 当前发言者集合（有序去重）
    pub speakers: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

/// 创建房间的输入
#[derive(Debug, Clone)]
pub struct RoomSpec {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub password: Option<String>,
    pub max_users: u32,
    pub is_broadcast: bool,
    pub host_id: Option<UserId>,
}

impl RoomSpec {
    pub fn new(id: RoomId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            is_private: false,
            password: None,
            max_users: DEFAULT_MAX_USERS,
            is_broadcast: false,
            host_id: None,
        }
    }
}

/// 更新房间的补丁，`None` 字段保持不变
#[derive(Debug, Clone, Default)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub is_private: Option<bool>,
    pub password: Option<Option<String>>,
    pub max_users: Option<u32>,
    pub host_id: Option<Option<UserId>>,
}

impl Room {
    /// 依据创建输入构造房间
    pub fn create(spec: RoomSpec, created_by: UserId) -> DomainResult<Self> {
        let name = spec.name.trim().to_owned();
        if name.is_empty() {
            return Err(DomainError::validation_error("name", "cannot be empty"));
        }
        if spec.max_users == 0 {
            return Err(DomainError::validation_error(
                "max_users",
                "must be at least 1",
            ));
        }

        Ok(Self {
            id: spec.id,
            name,
            description: spec.description,
            created_by,
            is_default: false,
            is_active: true,
            is_private: spec.is_private,
            password: spec.password,
            max_users: spec.max_users,
            is_broadcast: spec.is_broadcast,
            host_id: spec.host_id,
            speak_queue: Vec::new(),
            speakers: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// 默认房间，缺失时自动补建
    pub fn general(created_by: UserId) -> Self {
        Self {
            id: RoomId::general(),
            name: "General".to_string(),
            description: Some("Default room".to_string()),
            created_by,
            is_default: true,
            is_active: true,
            is_private: false,
            password: None,
            max_users: 1000,
            is_broadcast: false,
            host_id: None,
            speak_queue: Vec::new(),
            speakers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// 应用更新补丁
    pub fn apply_patch(&mut self, patch: RoomPatch) -> DomainResult<()> {
        if let Some(name) = patch.name {
            let name = name.trim().to_owned();
            if name.is_empty() {
                return Err(DomainError::validation_error("name", "cannot be empty"));
            }
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        if let Some(is_private) = patch.is_private {
            self.is_private = is_private;
        }
        if let Some(password) = patch.password {
            self.password = password;
        }
        if let Some(max_users) = patch.max_users {
            if max_users == 0 {
                return Err(DomainError::validation_error(
                    "max_users",
                    "must be at least 1",
                ));
            }
            self.max_users = max_users;
        }
        if let Some(host_id) = patch.host_id {
            self.host_id = host_id;
        }
        Ok(())
    }

    pub fn is_full(&self, member_count: usize) -> bool {
        member_count >= self.max_users as usize
    }

    pub fn is_host(&self, user_id: UserId) -> bool {
        self.host_id == Some(user_id)
    }

    pub fn is_speaking(&self, user_id: UserId) -> bool {
        self.speakers.contains(&user_id)
    }

    pub fn is_queued(&self, user_id: UserId) -> bool {
        self.speak_queue.contains(&user_id)
    }

    /// 申请发言：已在队列或已是发言者时为空操作，返回 `false`；
    /// 否则追加到队尾并返回 `true`。
    pub fn request_mic(&mut self, user_id: UserId) -> bool {
        if self.is_queued(user_id) || self.is_speaking(user_id) {
            return false;
        }
        self.speak_queue.push(user_id);
        true
    }

    /// 批准发言：从队列移除并加入发言者集合。
    /// 已是发言者时为幂等的成功空操作。返回是否新增了发言者。
    pub fn approve_mic(&mut self, user_id: UserId) -> bool {
        self.speak_queue.retain(|id| *id != user_id);
        if self.is_speaking(user_id) {
            return false;
        }
        self.speakers.push(user_id);
        true
    }

    /// 拒绝申请：只从队列移除。不在队列时为空操作。
    pub fn reject_mic(&mut self, user_id: UserId) -> bool {
        let before = self.speak_queue.len();
        self.speak_queue.retain(|id| *id != user_id);
        self.speak_queue.len() != before
    }

    /// 移除发言者：只从发言者集合移除。
    pub fn remove_speaker(&mut self, user_id: UserId) -> bool {
        let before = self.speakers.len();
        self.speakers.retain(|id| *id != user_id);
        self.speakers.len() != before
    }
}
