//! 应用层错误类型
//!
//! 每个错误都带一个稳定的错误码，通过 `error` 事件回报给
//! 发起请求的那一条连接，绝不影响其他连接。

use domain::{DomainError, RepositoryError, RoomId};
use thiserror::Error;

/// 应用层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("authentication required")]
    NotAuthenticated,

    #[error("too many concurrent connections")]
    TooManyConnections,

    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("room already exists: {0}")]
    DuplicateRoom(RoomId),

    #[error("the general room cannot be left or deleted")]
    ProtectedRoom,

    #[error("room is full")]
    CapacityExceeded,

    #[error("access denied")]
    AccessDenied,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("rate limit exceeded, retry in {reset_in_ms}ms")]
    RateLimitExceeded { reset_in_ms: u64 },

    #[error("spam burst detected")]
    SpamDetected,

    #[error("not a broadcast room: {0}")]
    NotBroadcastRoom(RoomId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// 稳定的错误码，随 `error` 事件下发
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotAuthenticated => "NOT_AUTHENTICATED",
            ChatError::TooManyConnections => "TOO_MANY_CONNECTIONS",
            ChatError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            ChatError::DuplicateRoom(_) => "DUPLICATE_ROOM",
            ChatError::ProtectedRoom => "PROTECTED_ROOM",
            ChatError::CapacityExceeded => "CAPACITY_EXCEEDED",
            ChatError::AccessDenied => "ACCESS_DENIED",
            ChatError::PermissionDenied => "PERMISSION_DENIED",
            ChatError::InvalidContent(_) => "INVALID_CONTENT",
            ChatError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ChatError::SpamDetected => "SPAM_DETECTED",
            ChatError::NotBroadcastRoom(_) => "NOT_BROADCAST_ROOM",
            ChatError::Internal(_) => "INTERNAL",
        }
    }

    /// 预期内的客户端错误以 debug 级别记录，避免错误风暴刷爆日志
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, ChatError::Internal(_))
    }
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        ChatError::Internal(err.to_string())
    }
}

impl From<DomainError> for ChatError {
    fn from(err: DomainError) -> Self {
        ChatError::InvalidContent(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
