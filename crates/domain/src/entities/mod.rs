//! 领域实体定义
//!
//! 包含系统的核心实体：用户、房间、成员关系、消息。

pub mod membership;
pub mod message;
pub mod room;
pub mod user;

pub use membership::RoomMembership;
pub use message::{Message, MessageKind, NewMessage, MAX_CONTENT_LEN};
pub use room::{Room, RoomSpec, RoomPatch};
pub use user::{User, UserRole};
