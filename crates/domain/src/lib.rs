//! 实时群聊系统核心领域模型
//!
//! 包含用户、房间、成员关系、消息等核心实体，以及持久化存储的窄接口。

pub mod entities;
pub mod errors;
pub mod events;
pub mod store;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use store::*;
pub use value_objects::*;
