//! 会话生命周期的端到端测试：认证、连接上限、消息扇出、
//! 刷屏处罚、心跳驱逐、断开清理。

mod common;

use std::time::Duration;

use application::{ClientEvent, RateGuardConfig, ServerEvent, SessionConfig, UserSummary};
use domain::{ChatStore, RoomId, RoomPatch, UserRole};

use common::{setup, setup_with, TestClient};

fn error_code(event: &ServerEvent) -> Option<&str> {
    match event {
        ServerEvent::Error { code, .. } => Some(code.as_str()),
        _ => None,
    }
}

#[tokio::test]
async fn test_authenticate_returns_snapshot() {
    let env = setup().await;
    let (user, mut client) = env.connect("alice", UserRole::Member).await;

    let events = client.drain();
    assert!(matches!(
        &events[0],
        ServerEvent::Authenticated { user: summary } if summary.id == user.id
    ));
    match &events[1] {
        ServerEvent::RoomJoined { room, online_users } => {
            assert!(room.id.is_general());
            assert_eq!(online_users.len(), 1);
            assert_eq!(online_users[0].id, user.id);
        }
        other => panic!("expected roomJoined, got {other:?}"),
    }

    // 成员关系已落库
    assert!(env
        .store
        .is_member(&RoomId::general(), user.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let env = setup().await;
    let mut client = env.authenticate("no-such-token").await;

    let events = client.drain();
    assert_eq!(error_code(&events[0]), Some("NOT_AUTHENTICATED"));
    assert_eq!(env.registry.connection_count(), 0);
}

#[tokio::test]
async fn test_banned_user_rejected() {
    let env = setup().await;
    let mut user = env.add_user("badguy", UserRole::Member).await;
    user.is_banned = true;
    user.banned_until = None;
    env.store.insert_user(user).await;

    let mut client = env.authenticate("badguy").await;
    let events = client.drain();
    assert_eq!(error_code(&events[0]), Some("ACCESS_DENIED"));
    assert_eq!(env.registry.connection_count(), 0);
}

#[tokio::test]
async fn test_failed_join_does_not_mark_user_online() {
    let env = setup().await;
    let admin = env.add_user("admin", UserRole::Admin).await;

    // 把默认房间容量压到 1，让第二个用户的认证在进房这一步失败
    env.directory
        .update_room(
            &RoomId::general(),
            RoomPatch {
                max_users: Some(1),
                ..Default::default()
            },
            &UserSummary::from(&admin),
        )
        .await
        .unwrap();
    let (_alice, _alice_client) = env.connect("alice", UserRole::Member).await;

    let bob = env.add_user("bob", UserRole::Member).await;
    let mut client = env.authenticate("bob").await;
    let events = client.drain();
    assert_eq!(error_code(&events[0]), Some("CAPACITY_EXCEEDED"));
    assert_eq!(env.registry.connection_count(), 1);

    // 认证失败的用户不能在库里留下在线标记
    env.settle().await;
    let stored = env.store.get_user(bob.id).await.unwrap().unwrap();
    assert!(!stored.is_online);
}

#[tokio::test]
async fn test_fourth_connection_rejected() {
    let env = setup().await;
    let user = env.add_user("multi", UserRole::Member).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(env.authenticate("multi").await);
    }
    assert_eq!(env.registry.connections_of(user.id).len(), 3);

    let mut fourth = env.authenticate("multi").await;
    let events = fourth.drain();
    assert_eq!(error_code(&events[0]), Some("TOO_MANY_CONNECTIONS"));
    assert_eq!(env.registry.connections_of(user.id).len(), 3);
}

#[tokio::test]
async fn test_unauthenticated_operations_have_no_side_effects() {
    let env = setup().await;
    let mut client = TestClient::new();

    env.coordinator
        .handle_event(
            client.connection_id,
            &client.tx,
            ClientEvent::JoinRoom {
                room_id: RoomId::general(),
                password: None,
            },
        )
        .await;
    env.coordinator
        .handle_event(
            client.connection_id,
            &client.tx,
            ClientEvent::Message {
                content: "sneaky".to_string(),
                room_id: Some(RoomId::general()),
                receiver_id: None,
                kind: Default::default(),
            },
        )
        .await;

    let events = client.drain();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| error_code(e) == Some("NOT_AUTHENTICATED")));
    assert_eq!(env.store.message_count().await, 0);
}

#[tokio::test]
async fn test_ping_answers_pong_before_auth() {
    let env = setup().await;
    let mut client = TestClient::new();

    env.coordinator
        .handle_event(client.connection_id, &client.tx, ClientEvent::Ping)
        .await;
    let events = client.drain();
    assert!(matches!(events[0], ServerEvent::Pong { .. }));
}

#[tokio::test]
async fn test_hello_is_delivered_to_all_members_exactly_once() {
    let env = setup().await;
    let (_alice, mut alice) = env.connect("alice", UserRole::Member).await;
    let (_bob, mut bob) = env.connect("bob", UserRole::Member).await;
    env.settle().await;
    alice.drain();
    bob.drain();

    env.coordinator
        .handle_event(
            alice.connection_id,
            &alice.tx,
            ClientEvent::Message {
                content: "hello".to_string(),
                room_id: Some(RoomId::general()),
                receiver_id: None,
                kind: Default::default(),
            },
        )
        .await;

    let count_new_messages = |events: &[ServerEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::NewMessage { message } if message.content == "hello"))
            .count()
    };
    // 发送者也收到，且各恰好一次
    assert_eq!(count_new_messages(&alice.drain()), 1);
    assert_eq!(count_new_messages(&bob.drain()), 1);
    assert_eq!(env.store.message_count().await, 1);
}

#[tokio::test]
async fn test_direct_message_reaches_only_both_parties() {
    let env = setup().await;
    let (_a, mut alice) = env.connect("alice", UserRole::Member).await;
    let (bob_user, mut bob) = env.connect("bob", UserRole::Member).await;
    let (_c, mut carol) = env.connect("carol", UserRole::Member).await;
    env.settle().await;
    alice.drain();
    bob.drain();
    carol.drain();

    env.coordinator
        .handle_event(
            alice.connection_id,
            &alice.tx,
            ClientEvent::Message {
                content: "psst".to_string(),
                room_id: None,
                receiver_id: Some(bob_user.id),
                kind: Default::default(),
            },
        )
        .await;

    let is_dm = |e: &ServerEvent| matches!(e, ServerEvent::NewMessage { message } if message.is_direct());
    assert_eq!(alice.drain().iter().filter(|e| is_dm(e)).count(), 1);
    assert_eq!(bob.drain().iter().filter(|e| is_dm(e)).count(), 1);
    assert_eq!(carol.drain().iter().filter(|e| is_dm(e)).count(), 0);
}

#[tokio::test]
async fn test_message_content_is_sanitized_or_rejected() {
    let env = setup().await;
    let (_user, mut client) = env.connect("alice", UserRole::Member).await;
    client.drain();

    env.coordinator
        .handle_event(
            client.connection_id,
            &client.tx,
            ClientEvent::Message {
                content: "<script>alert(1)</script>".to_string(),
                room_id: Some(RoomId::general()),
                receiver_id: None,
                kind: Default::default(),
            },
        )
        .await;
    let events = client.drain();
    let delivered: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage { message } => Some(message.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec!["alert(1)".to_string()]);

    env.coordinator
        .handle_event(
            client.connection_id,
            &client.tx,
            ClientEvent::Message {
                content: "<b></b>".to_string(),
                room_id: Some(RoomId::general()),
                receiver_id: None,
                kind: Default::default(),
            },
        )
        .await;
    let events = client.drain();
    assert_eq!(error_code(&events[0]), Some("INVALID_CONTENT"));
}

#[tokio::test]
async fn test_spam_burst_applies_temporary_mute() {
    let env = setup().await;
    let (_user, mut client) = env.connect("spammer", UserRole::Member).await;
    client.drain();

    // 连发 12 条：前 10 条过，第 11 条触发刷屏检测并禁言，第 12 条吃禁言
    for i in 0..12 {
        env.coordinator
            .handle_event(
                client.connection_id,
                &client.tx,
                ClientEvent::Message {
                    content: format!("flood {i}"),
                    room_id: Some(RoomId::general()),
                    receiver_id: None,
                    kind: Default::default(),
                },
            )
            .await;
    }

    let events = client.drain();
    let delivered = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::NewMessage { .. }))
        .count();
    let spam_errors = events
        .iter()
        .filter(|e| error_code(e) == Some("SPAM_DETECTED"))
        .count();
    assert_eq!(delivered, 10);
    assert_eq!(spam_errors, 2);
    assert_eq!(env.store.message_count().await, 10);
}

#[tokio::test]
async fn test_rate_limit_reports_reset_time() {
    // 把刷屏阈值调高，让主窗口限额先触发
    let env = setup_with(
        SessionConfig::default(),
        RateGuardConfig {
            max_ops: 5,
            burst_threshold: 100,
            ..RateGuardConfig::default()
        },
    )
    .await;
    let (_user, mut client) = env.connect("chatty", UserRole::Member).await;
    client.drain();

    for i in 0..6 {
        env.coordinator
            .handle_event(
                client.connection_id,
                &client.tx,
                ClientEvent::Message {
                    content: format!("msg {i}"),
                    room_id: Some(RoomId::general()),
                    receiver_id: None,
                    kind: Default::default(),
                },
            )
            .await;
    }

    let events = client.drain();
    let rate_errors: Vec<_> = events
        .iter()
        .filter(|e| error_code(e) == Some("RATE_LIMIT_EXCEEDED"))
        .collect();
    assert_eq!(rate_errors.len(), 1);
    match rate_errors[0] {
        ServerEvent::Error { message, .. } => assert!(message.contains("ms")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_disconnect_notifies_peers_exactly_once() {
    let env = setup().await;
    let (alice_user, alice) = env.connect("alice", UserRole::Member).await;
    let (_bob, mut bob) = env.connect("bob", UserRole::Member).await;
    env.settle().await;
    bob.drain();

    env.coordinator.disconnect(alice.connection_id).await;
    env.settle().await;

    let left: Vec<_> = bob
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::UserLeftRoom { user_id, .. } if *user_id == alice_user.id))
        .collect();
    assert_eq!(left.len(), 1);

    // 断开只收回在场状态，成员关系仍在
    assert!(env
        .store
        .is_member(&RoomId::general(), alice_user.id)
        .await
        .unwrap());
    // 重复断开是空操作
    env.coordinator.disconnect(alice.connection_id).await;
}

#[tokio::test]
async fn test_second_connection_keeps_presence_on_disconnect() {
    let env = setup().await;
    let (_alice_user, _c1) = env.connect("alice", UserRole::Member).await;
    let c2 = env.authenticate("alice").await;
    let (_bob, mut bob) = env.connect("bob", UserRole::Member).await;
    env.settle().await;
    bob.drain();

    // alice 还有另一条连接在 general，断开一条不通知离开
    env.coordinator.disconnect(c2.connection_id).await;
    env.settle().await;
    assert!(bob
        .drain()
        .iter()
        .all(|e| !matches!(e, ServerEvent::UserLeftRoom { .. })));
}

#[tokio::test]
async fn test_heartbeat_evicts_silent_connections() {
    let env = setup_with(
        SessionConfig {
            heartbeat_interval: Duration::from_millis(30),
            heartbeat_timeout: Duration::from_millis(80),
            ..SessionConfig::default()
        },
        RateGuardConfig::default(),
    )
    .await;
    let (_user, mut client) = env.connect("sleepy", UserRole::Member).await;
    client.drain();

    let sweeper = env.coordinator.clone().run_heartbeat();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = client.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::Kicked { .. })));
    assert_eq!(env.registry.connection_count(), 0);

    sweeper.abort();
}

#[tokio::test]
async fn test_typing_fans_out_without_persistence() {
    let env = setup().await;
    let (alice_user, alice) = env.connect("alice", UserRole::Member).await;
    let (_bob, mut bob) = env.connect("bob", UserRole::Member).await;
    env.settle().await;
    bob.drain();

    env.coordinator
        .handle_event(
            alice.connection_id,
            &alice.tx,
            ClientEvent::Typing { is_typing: true },
        )
        .await;

    let events = bob.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::UserTyping { user_id, is_typing: true, .. } if *user_id == alice_user.id
    )));
    assert_eq!(env.store.message_count().await, 0);
}
