//! 集成测试公共脚手架：内存存储 + 桩令牌校验器

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use application::{
    ChatError, ChatResult, ClientEvent, ConnectionRegistry, MemoryChatStore, MessageRouter,
    RateGuard, RateGuardConfig, RegistryConfig, RoomDirectory, ServerEvent, SessionConfig,
    SessionCoordinator, TokenVerifier,
};
use domain::{ChatStore, ConnectionId, User, UserId, UserRole};

/// 令牌 → 用户ID 的桩校验器
#[derive(Default)]
pub struct StubVerifier {
    tokens: Mutex<HashMap<String, UserId>>,
}

impl StubVerifier {
    pub fn grant(&self, token: &str, user_id: UserId) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), user_id);
    }
}

impl TokenVerifier for StubVerifier {
    fn verify(&self, token: &str) -> ChatResult<UserId> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or(ChatError::NotAuthenticated)
    }
}

pub struct TestEnv {
    pub store: Arc<MemoryChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<RoomDirectory>,
    pub router: Arc<MessageRouter>,
    pub coordinator: Arc<SessionCoordinator>,
    pub verifier: Arc<StubVerifier>,
}

/// 一个已连接的测试客户端
pub struct TestClient {
    pub connection_id: ConnectionId,
    pub tx: mpsc::UnboundedSender<ServerEvent>,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connection_id: ConnectionId::generate(),
            tx,
            rx,
        }
    }

    /// 取空当前积压的事件
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn setup() -> TestEnv {
    setup_with(SessionConfig::default(), RateGuardConfig::default()).await
}

pub async fn setup_with(session: SessionConfig, rate: RateGuardConfig) -> TestEnv {
    let store = Arc::new(MemoryChatStore::new());
    let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
    let directory = Arc::new(RoomDirectory::new(
        store.clone() as Arc<dyn ChatStore>,
        registry.clone(),
    ));
    directory.load_rooms().await.unwrap();

    let rate_guard = Arc::new(RateGuard::new(rate));
    let router = Arc::new(MessageRouter::new(
        store.clone() as Arc<dyn ChatStore>,
        registry.clone(),
        directory.clone(),
        rate_guard.clone(),
    ));
    router.spawn_lifecycle_fanout();

    let verifier = Arc::new(StubVerifier::default());
    let coordinator = Arc::new(SessionCoordinator::new(
        store.clone() as Arc<dyn ChatStore>,
        registry.clone(),
        directory.clone(),
        router.clone(),
        rate_guard,
        verifier.clone(),
        session,
    ));

    TestEnv {
        store,
        registry,
        directory,
        router,
        coordinator,
        verifier,
    }
}

impl TestEnv {
    /// 建用户、发令牌
    pub async fn add_user(&self, name: &str, role: UserRole) -> User {
        let user = User::new(name, role).unwrap();
        self.verifier.grant(name, user.id);
        self.store.insert_user(user.clone()).await;
        user
    }

    /// 建用户并完成认证握手
    pub async fn connect(&self, name: &str, role: UserRole) -> (User, TestClient) {
        let user = self.add_user(name, role).await;
        let client = self.authenticate(name).await;
        (user, client)
    }

    /// 用已有令牌认证一条新连接
    pub async fn authenticate(&self, token: &str) -> TestClient {
        let client = TestClient::new();
        self.coordinator
            .handle_event(
                client.connection_id,
                &client.tx,
                ClientEvent::Authenticate {
                    token: token.to_string(),
                },
            )
            .await;
        client
    }

    /// 等生命周期扇出任务消化完广播通道里的事件
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
