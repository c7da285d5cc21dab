//! 进程内连接注册表
//!
//! 连接 ↔ 用户映射、按用户的连接数上限、心跳活性追踪，
//! 以及按房间的在线快照。所有操作同步、内存内完成，
//! 一把读写锁守住全部状态。
//! 连接从不持久化，进程重启即全部消失。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use domain::{ConnectionId, RoomId, UserId};

use crate::error::{ChatError, ChatResult};
use crate::protocol::{ServerEvent, UserSummary};

/// 注册表配置
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 每用户并发连接上限
    pub max_connections_per_user: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 3,
        }
    }
}

/// 注销连接后的级联信息，供协调层收尾
#[derive(Debug, Clone)]
pub struct UnregisterSummary {
    pub user: UserSummary,
    /// 连接断开时所在的房间
    pub current_room: Option<RoomId>,
    /// 是否是该用户最后一条连接
    pub last_connection: bool,
}

struct ConnectionEntry {
    user: UserSummary,
    sender: mpsc::UnboundedSender<ServerEvent>,
    current_room: Option<RoomId>,
    last_activity: Instant,
    /// 全局注册序号，决定投递顺序
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// 按注册顺序维护的用户连接列表
    by_user: HashMap<UserId, Vec<ConnectionId>>,
    /// 进程内临时禁言（刷屏处罚）
    muted_until: HashMap<UserId, DateTime<Utc>>,
    next_seq: u64,
}

/// 连接注册表
pub struct ConnectionRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册已认证的连接，超出连接上限返回 [`ChatError::TooManyConnections`]
    pub fn register(
        &self,
        connection_id: ConnectionId,
        user: UserSummary,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> ChatResult<()> {
        let mut state = self.write();

        let existing = state.by_user.entry(user.id).or_default();
        if existing.len() >= self.config.max_connections_per_user {
            return Err(ChatError::TooManyConnections);
        }
        existing.push(connection_id);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                user,
                sender,
                current_room: None,
                last_activity: Instant::now(),
                seq,
            },
        );
        Ok(())
    }

    /// 注销连接，返回级联信息；重复注销返回 `None`
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<UnregisterSummary> {
        let mut state = self.write();
        let entry = state.connections.remove(&connection_id)?;

        let user_id = entry.user.id;
        let last_connection = match state.by_user.get_mut(&user_id) {
            Some(conns) => {
                conns.retain(|id| *id != connection_id);
                if conns.is_empty() {
                    state.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        Some(UnregisterSummary {
            user: entry.user,
            current_room: entry.current_room,
            last_connection,
        })
    }

    /// 刷新活性时间戳
    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.write().connections.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn is_alive(&self, connection_id: ConnectionId, timeout: Duration) -> bool {
        self.read()
            .connections
            .get(&connection_id)
            .map(|entry| entry.last_activity.elapsed() < timeout)
            .unwrap_or(false)
    }

    /// 超时未活动的连接，供心跳清扫器驱逐
    pub fn expired(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.read()
            .connections
            .iter()
            .filter(|(_, entry)| entry.last_activity.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// 用户的全部连接，按注册顺序
    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.read()
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserSummary> {
        self.read()
            .connections
            .get(&connection_id)
            .map(|entry| entry.user.clone())
    }

    pub fn current_room(&self, connection_id: ConnectionId) -> Option<RoomId> {
        self.read()
            .connections
            .get(&connection_id)
            .and_then(|entry| entry.current_room.clone())
    }

    pub fn set_current_room(&self, connection_id: ConnectionId, room_id: Option<RoomId>) {
        if let Some(entry) = self.write().connections.get_mut(&connection_id) {
            entry.current_room = room_id;
        }
    }

    /// 把某房间内的所有连接移到"无房间"状态（房间删除级联）
    pub fn detach_room(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        let mut state = self.write();
        let mut detached = Vec::new();
        for (id, entry) in state.connections.iter_mut() {
            if entry.current_room.as_ref() == Some(room_id) {
                entry.current_room = None;
                detached.push(*id);
            }
        }
        detached
    }

    /// 房间内的在线用户快照（按用户去重，注册顺序）
    pub fn users_in_room(&self, room_id: &RoomId) -> Vec<UserSummary> {
        let state = self.read();
        let mut entries: Vec<&ConnectionEntry> = state
            .connections
            .values()
            .filter(|entry| entry.current_room.as_ref() == Some(room_id))
            .collect();
        entries.sort_by_key(|entry| entry.seq);

        let mut seen = Vec::new();
        let mut users = Vec::new();
        for entry in entries {
            if !seen.contains(&entry.user.id) {
                seen.push(entry.user.id);
                users.push(entry.user.clone());
            }
        }
        users
    }

    /// 该用户在指定房间内是否还有存活连接
    pub fn user_present_in_room(&self, user_id: UserId, room_id: &RoomId) -> bool {
        self.read().connections.values().any(|entry| {
            entry.user.id == user_id && entry.current_room.as_ref() == Some(room_id)
        })
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.read().by_user.contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn online_user_count(&self) -> usize {
        self.read().by_user.len()
    }

    // ---- 投递 ----

    /// 发给单条连接，发送失败只记日志
    pub fn send_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let state = self.read();
        match state.connections.get(&connection_id) {
            Some(entry) => {
                if entry.sender.send(event).is_err() {
                    debug!(connection_id = %connection_id, "delivery failed, receiver dropped");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// 按全局注册顺序发给一组用户的所有存活连接，返回投递条数
    ///
    /// 扇出持独占锁：并发扇出互斥，所有接收端观察到同一条投递顺序。
    pub fn send_to_users(&self, user_ids: &[UserId], event: &ServerEvent) -> usize {
        let state = self.write();
        let mut targets: Vec<&ConnectionEntry> = state
            .connections
            .values()
            .filter(|entry| user_ids.contains(&entry.user.id))
            .collect();
        targets.sort_by_key(|entry| entry.seq);

        let mut delivered = 0;
        for entry in targets {
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(user_id = %entry.user.id, "delivery failed, receiver dropped");
            }
        }
        delivered
    }

    /// 发给所有连接，与 [`ConnectionRegistry::send_to_users`] 同样互斥
    pub fn send_to_all(&self, event: &ServerEvent) -> usize {
        let state = self.write();
        let mut targets: Vec<&ConnectionEntry> = state.connections.values().collect();
        targets.sort_by_key(|entry| entry.seq);

        let mut delivered = 0;
        for entry in targets {
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // ---- 临时禁言 ----

    /// 进程内临时禁言（刷屏处罚），不落库
    pub fn mute_user(&self, user_id: UserId, until: DateTime<Utc>) {
        self.write().muted_until.insert(user_id, until);
    }

    pub fn is_muted(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        let mut state = self.write();
        match state.muted_until.get(&user_id) {
            Some(until) if now < *until => true,
            Some(_) => {
                // 过期条目顺手清掉
                state.muted_until.remove(&user_id);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserRole;

    fn summary(name: &str) -> UserSummary {
        UserSummary {
            id: UserId::generate(),
            username: name.to_string(),
            role: UserRole::Member,
        }
    }

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_connection_cap_enforced() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let user = summary("alice");

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = channel();
            receivers.push(rx);
            registry
                .register(ConnectionId::generate(), user.clone(), tx)
                .unwrap();
        }
        assert_eq!(registry.connections_of(user.id).len(), 3);

        // 第 4 条连接被拒
        let (tx, _rx) = channel();
        let result = registry.register(ConnectionId::generate(), user.clone(), tx);
        assert_eq!(result, Err(ChatError::TooManyConnections));
        assert_eq!(registry.connections_of(user.id).len(), 3);
    }

    #[test]
    fn test_unregister_cascade_summary() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let user = summary("bob");
        let (c1, c2) = (ConnectionId::generate(), ConnectionId::generate());

        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        registry.register(c1, user.clone(), tx1).unwrap();
        registry.register(c2, user.clone(), tx2).unwrap();
        registry.set_current_room(c1, Some(RoomId::general()));

        let summary1 = registry.unregister(c1).unwrap();
        assert_eq!(summary1.current_room, Some(RoomId::general()));
        assert!(!summary1.last_connection);

        let summary2 = registry.unregister(c2).unwrap();
        assert!(summary2.last_connection);
        assert!(!registry.is_user_online(user.id));

        // 重复注销是空操作
        assert!(registry.unregister(c2).is_none());
    }

    #[test]
    fn test_liveness_tracking() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let user = summary("carol");
        let conn = ConnectionId::generate();
        let (tx, _rx) = channel();
        registry.register(conn, user, tx).unwrap();

        assert!(registry.is_alive(conn, Duration::from_secs(60)));
        assert!(registry.expired(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.is_alive(conn, Duration::from_millis(10)));
        assert_eq!(registry.expired(Duration::from_millis(10)), vec![conn]);

        registry.touch(conn);
        assert!(registry.is_alive(conn, Duration::from_millis(10)));
    }

    #[test]
    fn test_room_presence_snapshot() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let room = RoomId::general();
        let (alice, bob) = (summary("alice"), summary("bob"));

        let (a1, a2, b1) = (
            ConnectionId::generate(),
            ConnectionId::generate(),
            ConnectionId::generate(),
        );
        let (tx, _r1) = channel();
        registry.register(a1, alice.clone(), tx).unwrap();
        let (tx, _r2) = channel();
        registry.register(a2, alice.clone(), tx).unwrap();
        let (tx, _r3) = channel();
        registry.register(b1, bob.clone(), tx).unwrap();

        registry.set_current_room(a1, Some(room.clone()));
        registry.set_current_room(a2, Some(room.clone()));
        registry.set_current_room(b1, Some(room.clone()));

        // 按用户去重，注册顺序
        let users = registry.users_in_room(&room);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[1].username, "bob");

        registry.set_current_room(a1, None);
        assert!(registry.user_present_in_room(alice.id, &room));
        registry.set_current_room(a2, None);
        assert!(!registry.user_present_in_room(alice.id, &room));
    }

    #[test]
    fn test_delivery_order_and_fire_and_forget() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let (alice, bob) = (summary("alice"), summary("bob"));

        let (tx_a, mut rx_a) = channel();
        let (tx_b, rx_b) = channel();
        registry
            .register(ConnectionId::generate(), alice.clone(), tx_a)
            .unwrap();
        registry
            .register(ConnectionId::generate(), bob.clone(), tx_b)
            .unwrap();

        // bob 的接收端已关闭，不能影响 alice 的投递
        drop(rx_b);
        let event = ServerEvent::Kicked {
            reason: "test".to_string(),
        };
        let delivered = registry.send_to_users(&[alice.id, bob.id], &event);
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fanout_keeps_receivers_in_same_order() {
        use std::sync::Arc;

        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let (alice, bob) = (summary("alice"), summary("bob"));
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry
            .register(ConnectionId::generate(), alice.clone(), tx_a)
            .unwrap();
        registry
            .register(ConnectionId::generate(), bob.clone(), tx_b)
            .unwrap();

        let mut tasks = Vec::new();
        for task in 0..4u32 {
            let registry = Arc::clone(&registry);
            let targets = [alice.id, bob.id];
            tasks.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    let event = ServerEvent::Kicked {
                        reason: format!("{task}-{i}"),
                    };
                    registry.send_to_users(&targets, &event);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let drain = |rx: &mut mpsc::UnboundedReceiver<ServerEvent>| {
            let mut seen = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let ServerEvent::Kicked { reason } = event {
                    seen.push(reason);
                }
            }
            seen
        };
        // 两个接收端看到完全一致的投递顺序
        let order_a = drain(&mut rx_a);
        let order_b = drain(&mut rx_b);
        assert_eq!(order_a.len(), 100);
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn test_temporary_mute_expires() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let user = summary("spammer");
        let now = Utc::now();

        registry.mute_user(user.id, now + chrono::Duration::minutes(5));
        assert!(registry.is_muted(user.id, now));
        assert!(!registry.is_muted(user.id, now + chrono::Duration::minutes(6)));
        // 过期后条目被清理
        assert!(!registry.is_muted(user.id, now));
    }

    #[test]
    fn test_detach_room() {
        let registry = ConnectionRegistry::new(RegistryConfig::default());
        let room = RoomId::parse("doomed").unwrap();
        let user = summary("dave");
        let conn = ConnectionId::generate();
        let (tx, _rx) = channel();
        registry.register(conn, user, tx).unwrap();
        registry.set_current_room(conn, Some(room.clone()));

        let detached = registry.detach_room(&room);
        assert_eq!(detached, vec![conn]);
        assert_eq!(registry.current_room(conn), None);
    }
}
