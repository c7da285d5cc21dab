//! 用户实体定义
//!
//! 用户本身由外部持久化存储管理，核心只在认证时读取、
//! 在上线/下线时回写 `is_online` 标记。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::UserId;

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Guest,
    Member,
    Moderator,
    Admin,
    Owner,
}

impl UserRole {
    /// 是否拥有管理特权（主持人审批、删除房间等）
    pub fn is_privileged(&self) -> bool {
        matches!(self, UserRole::Moderator | UserRole::Admin | UserRole::Owner)
    }

    /// 是否可以创建房间
    pub fn can_create_rooms(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Owner)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Guest => write!(f, "guest"),
            UserRole::Member => write!(f, "member"),
            UserRole::Moderator => write!(f, "moderator"),
            UserRole::Admin => write!(f, "admin"),
            UserRole::Owner => write!(f, "owner"),
        }
    }
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Guest
    }
}

/// 用户实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// 用户唯一ID
    pub id: UserId,
    /// 用户名（唯一）
    pub username: String,
    /// 角色
    pub role: UserRole,
    /// 在线标记，仅在注册/注销连接时翻转
    pub is_online: bool,
    /// 禁言截止时间
    pub muted_until: Option<DateTime<Utc>>,
    /// 封禁截止时间；`None` 且 `is_banned` 为真表示永久封禁
    pub is_banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl User {
    /// 创建新用户
    pub fn new(username: impl Into<String>, role: UserRole) -> DomainResult<Self> {
        let username = username.into();
        Self::validate_username(&username)?;

        Ok(Self {
            id: UserId::generate(),
            username,
            role,
            is_online: false,
            muted_until: None,
            is_banned: false,
            banned_until: None,
            created_at: Utc::now(),
        })
    }

    /// 当前是否处于封禁状态（限时封禁到期自动失效）
    pub fn is_ban_active(&self, now: DateTime<Utc>) -> bool {
        if !self.is_banned {
            return false;
        }
        match self.banned_until {
            Some(until) => now < until,
            None => true,
        }
    }

    /// 当前是否处于禁言状态
    pub fn is_mute_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.muted_until, Some(until) if now < until)
    }

    /// 验证用户名格式
    fn validate_username(username: &str) -> DomainResult<()> {
        if username.len() < 2 {
            return Err(DomainError::validation_error(
                "username",
                "must be at least 2 characters",
            ));
        }
        if username.len() > 50 {
            return Err(DomainError::validation_error(
                "username",
                "must be at most 50 characters",
            ));
        }
        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(DomainError::validation_error(
                "username",
                "only letters, digits, '_' and '-' are allowed",
            ));
        }
        Ok(())
    }
}
