//! 按用户的滑动窗口限流与刷屏检测
//!
//! 主窗口（默认 60 秒 30 次）在每次 check 时都计数，
//! 探测式调用不会重置窗口。独立的短窗口（默认 10 秒 10 次）
//! 检测刷屏爆发，触发时由调用方决定禁言策略。
//! 状态只存在于进程内，重启即清零。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use domain::UserId;

/// 限流的操作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// 发送消息
    Message,
    /// 加入/离开/创建房间
    RoomAction,
    /// 广播房间的发言操作
    MicAction,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Message => "message",
            OpClass::RoomAction => "room_action",
            OpClass::MicAction => "mic_action",
        }
    }
}

/// 限流配置
#[derive(Debug, Clone)]
pub struct RateGuardConfig {
    /// 主窗口长度
    pub window: Duration,
    /// 主窗口内允许的操作数
    pub max_ops: u32,
    /// 刷屏检测窗口长度
    pub burst_window: Duration,
    /// 刷屏检测阈值
    pub burst_threshold: u32,
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_ops: 30,
            burst_window: Duration::from_secs(10),
            burst_threshold: 10,
        }
    }
}

/// 单次 check 的判定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// 主窗口剩余额度
    pub remaining: u32,
    /// 主窗口重置剩余毫秒数
    pub reset_in_ms: u64,
    /// 是否触发了刷屏检测
    pub spam_burst: bool,
}

struct WindowState {
    window_start: Instant,
    count: u32,
    burst_start: Instant,
    burst_count: u32,
    last_seen: Instant,
}

/// 限流器，内部一把读写锁，所有操作同步完成
pub struct RateGuard {
    config: RateGuardConfig,
    windows: RwLock<HashMap<(UserId, OpClass), WindowState>>,
}

impl RateGuard {
    pub fn new(config: RateGuardConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// 判定一次操作并计数
    pub fn check(&self, user_id: UserId, class: OpClass) -> RateDecision {
        self.check_at(user_id, class, Instant::now())
    }

    fn check_at(&self, user_id: UserId, class: OpClass, now: Instant) -> RateDecision {
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let state = windows.entry((user_id, class)).or_insert(WindowState {
            window_start: now,
            count: 0,
            burst_start: now,
            burst_count: 0,
            last_seen: now,
        });

        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.count = 0;
        }
        if now.duration_since(state.burst_start) >= self.config.burst_window {
            state.burst_start = now;
            state.burst_count = 0;
        }

        state.count += 1;
        state.burst_count += 1;
        state.last_seen = now;

        let spam_burst = state.burst_count > self.config.burst_threshold;
        let over_limit = state.count > self.config.max_ops;
        let window_end = state.window_start + self.config.window;
        let reset_in_ms = window_end.saturating_duration_since(now).as_millis() as u64;

        RateDecision {
            allowed: !over_limit && !spam_burst,
            remaining: self.config.max_ops.saturating_sub(state.count),
            reset_in_ms,
            spam_burst,
        }
    }

    /// 清理闲置超过 2 倍窗口长度的条目，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self.config.window * 2;
        let now = Instant::now();
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let before = windows.len();
        windows.retain(|_, state| now.duration_since(state.last_seen) < cutoff);
        before - windows.len()
    }

    /// 清除某用户的全部限流状态（管理操作）
    pub fn reset_user(&self, user_id: UserId) {
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        windows.retain(|(uid, _), _| *uid != user_id);
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RateGuard {
        RateGuard::new(RateGuardConfig::default())
    }

    #[test]
    fn test_limit_kicks_in_at_31st_call() {
        let guard = guard();
        let user = UserId::generate();
        let start = Instant::now();

        // 31 次调用分布在 60 秒窗口内，间隔拉开避免触发刷屏检测
        for i in 0..30 {
            let at = start + Duration::from_millis(i * 1900);
            let decision = guard.check_at(user, OpClass::Message, at);
            assert!(decision.allowed, "call {} should be allowed", i + 1);
        }

        let decision = guard.check_at(user, OpClass::Message, start + Duration::from_millis(57_000));
        assert!(!decision.allowed);
        assert!(!decision.spam_burst);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_in_ms > 0);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let guard = guard();
        let user = UserId::generate();
        let start = Instant::now();

        for i in 0..31 {
            guard.check_at(user, OpClass::Message, start + Duration::from_millis(i * 1900));
        }
        let decision = guard.check_at(user, OpClass::Message, start + Duration::from_secs(61));
        assert!(decision.allowed);
    }

    #[test]
    fn test_denied_calls_still_count() {
        let guard = guard();
        let user = UserId::generate();
        let start = Instant::now();

        for i in 0..40 {
            guard.check_at(user, OpClass::Message, start + Duration::from_millis(i * 1500));
        }
        // 被拒绝的调用也计数，窗口没有因为探测而重置
        let decision = guard.check_at(user, OpClass::Message, start + Duration::from_secs(59));
        assert!(!decision.allowed);
    }

    #[test]
    fn test_burst_detection_is_independent() {
        let guard = guard();
        let user = UserId::generate();
        let start = Instant::now();

        // 11 次调用挤进 1 秒：主窗口额度未用完，但刷屏检测触发
        let mut last = None;
        for i in 0..11 {
            last = Some(guard.check_at(user, OpClass::Message, start + Duration::from_millis(i * 90)));
        }
        let decision = last.unwrap();
        assert!(decision.spam_burst);
        assert!(!decision.allowed);
        assert!(decision.remaining > 0);
    }

    #[test]
    fn test_classes_are_isolated() {
        let guard = guard();
        let user = UserId::generate();
        let start = Instant::now();

        for i in 0..31 {
            guard.check_at(user, OpClass::Message, start + Duration::from_millis(i * 1900));
        }
        let decision = guard.check_at(user, OpClass::RoomAction, start + Duration::from_secs(59));
        assert!(decision.allowed);
    }

    #[test]
    fn test_sweep_drops_idle_entries() {
        let guard = RateGuard::new(RateGuardConfig {
            window: Duration::from_millis(10),
            ..RateGuardConfig::default()
        });
        let user = UserId::generate();

        guard.check(user, OpClass::Message);
        assert_eq!(guard.tracked_windows(), 1);

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(guard.sweep_expired(), 1);
        assert_eq!(guard.tracked_windows(), 0);
    }

    #[test]
    fn test_reset_user() {
        let guard = guard();
        let user = UserId::generate();
        let other = UserId::generate();

        guard.check(user, OpClass::Message);
        guard.check(user, OpClass::RoomAction);
        guard.check(other, OpClass::Message);

        guard.reset_user(user);
        assert_eq!(guard.tracked_windows(), 1);
    }
}
