use std::sync::Arc;
use std::time::Duration;

use application::SessionCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    /// 服务端主动 ping 的间隔
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(coordinator: Arc<SessionCoordinator>, ping_interval: Duration) -> Self {
        Self {
            coordinator,
            ping_interval,
        }
    }
}
