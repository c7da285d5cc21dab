//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 升级入口和健康检查，
//! 所有连接事件委托给应用层的会话协调器。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::JwtService;
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
