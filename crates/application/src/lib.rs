//! 连接、房间成员与在线状态协调层
//!
//! 六个核心组件，自底向上：
//! - [`rate_guard`] 滑动窗口限流与刷屏检测
//! - [`connection_registry`] 连接 ↔ 用户映射与活性追踪
//! - [`room_directory`] 房间与成员关系的权威内存视图
//! - [`mic_control`] 广播房间的轮流发言状态机
//! - [`message_router`] 校验、限流、落库、扇出
//! - [`session`] 把连接生命周期接到以上组件的门面

pub mod connection_registry;
pub mod error;
pub mod message_router;
pub mod mic_control;
pub mod protocol;
pub mod rate_guard;
pub mod room_directory;
pub mod sanitize;
pub mod session;
pub mod store_memory;

pub use connection_registry::{ConnectionRegistry, RegistryConfig, UnregisterSummary};
pub use error::{ChatError, ChatResult};
pub use message_router::MessageRouter;
pub use mic_control::MicController;
pub use protocol::{ClientEvent, ServerEvent, UserSummary};
pub use rate_guard::{OpClass, RateDecision, RateGuard, RateGuardConfig};
pub use room_directory::{RoomDirectory, RoomFilter, RoomStats};
pub use sanitize::sanitize_content;
pub use session::{SessionConfig, SessionCoordinator, TokenVerifier};
pub use store_memory::MemoryChatStore;
