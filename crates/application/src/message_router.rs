//! 消息路由
//!
//! 发送管线：认证校验 → 内容清洗 → 限流判定 → 落库 →
//! 向"房间成员 ∩ 存活连接"按注册顺序扇出。单条连接投递失败
//! 不影响其他连接。同时订阅房间目录的生命周期事件，把
//! 状态变更翻译成推送帧。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use domain::{
    ChatStore, ConnectionId, Message, MessageKind, NewMessage, RoomId, RoomLifecycleEvent, UserId,
};

use crate::connection_registry::ConnectionRegistry;
use crate::error::{ChatError, ChatResult};
use crate::protocol::ServerEvent;
use crate::rate_guard::{OpClass, RateGuard};
use crate::room_directory::RoomDirectory;
use crate::sanitize::sanitize_content;

/// 消息路由器
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RoomDirectory>,
    rate_guard: Arc<RateGuard>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RoomDirectory>,
        rate_guard: Arc<RateGuard>,
    ) -> Self {
        Self {
            store,
            registry,
            directory,
            rate_guard,
        }
    }

    /// 清洗 + 限流，两类消息共用的前半段管线
    fn validate(&self, sender_id: UserId, content: &str) -> ChatResult<String> {
        let content = sanitize_content(content)?;

        let decision = self.rate_guard.check(sender_id, OpClass::Message);
        if decision.spam_burst {
            warn!(user_id = %sender_id, "spam burst detected");
            return Err(ChatError::SpamDetected);
        }
        if !decision.allowed {
            debug!(user_id = %sender_id, reset_in_ms = decision.reset_in_ms, "rate limited");
            return Err(ChatError::RateLimitExceeded {
                reset_in_ms: decision.reset_in_ms,
            });
        }
        Ok(content)
    }

    /// 发送房间消息，返回已持久化的消息记录
    pub async fn send_room_message(
        &self,
        connection_id: ConnectionId,
        room_id: &RoomId,
        content: &str,
        kind: MessageKind,
    ) -> ChatResult<Message> {
        let sender = self
            .registry
            .user_of(connection_id)
            .ok_or(ChatError::NotAuthenticated)?;
        let content = self.validate(sender.id, content)?;

        let members = self.directory.members_of(room_id).await?;
        if !members.contains(&sender.id) {
            return Err(ChatError::AccessDenied);
        }

        // 广播房间里只有主持人和发言者可以发消息
        let room = self.directory.get_room(room_id).await?;
        if room.is_broadcast
            && !room.is_host(sender.id)
            && !room.is_speaking(sender.id)
            && !sender.role.is_privileged()
        {
            return Err(ChatError::PermissionDenied);
        }

        let message = Message::from_new(NewMessage {
            room_id: Some(room_id.clone()),
            receiver_id: None,
            sender_id: sender.id,
            sender_name: sender.username.clone(),
            content,
            kind,
        })?;
        self.store.create_message(&message).await.map_err(|err| {
            error!(room_id = %room_id, error = %err, "message persistence failed");
            ChatError::from(err)
        })?;

        let delivered = self.registry.send_to_users(
            &members,
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        debug!(
            message_id = %message.id,
            room_id = %room_id,
            delivered,
            "room message fanned out"
        );
        Ok(message)
    }

    /// 发送私聊消息，只投递给发送者与接收者的存活连接
    pub async fn send_direct_message(
        &self,
        connection_id: ConnectionId,
        receiver_id: UserId,
        content: &str,
        kind: MessageKind,
    ) -> ChatResult<Message> {
        let sender = self
            .registry
            .user_of(connection_id)
            .ok_or(ChatError::NotAuthenticated)?;
        let content = self.validate(sender.id, content)?;

        let message = Message::from_new(NewMessage {
            room_id: None,
            receiver_id: Some(receiver_id),
            sender_id: sender.id,
            sender_name: sender.username.clone(),
            content,
            kind,
        })?;
        self.store.create_message(&message).await.map_err(|err| {
            error!(receiver_id = %receiver_id, error = %err, "message persistence failed");
            ChatError::from(err)
        })?;

        let targets = if sender.id == receiver_id {
            vec![sender.id]
        } else {
            vec![sender.id, receiver_id]
        };
        let delivered = self.registry.send_to_users(
            &targets,
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        debug!(message_id = %message.id, delivered, "direct message fanned out");
        Ok(message)
    }

    /// 系统事件广播：指定房间发给成员，`None` 发给全部连接
    pub async fn broadcast_system_event(
        &self,
        room_id: Option<&RoomId>,
        event: ServerEvent,
    ) -> ChatResult<usize> {
        let delivered = match room_id {
            Some(room_id) => {
                let members = self.directory.members_of(room_id).await?;
                self.registry.send_to_users(&members, &event)
            }
            None => self.registry.send_to_all(&event),
        };
        Ok(delivered)
    }

    /// 启动生命周期事件的扇出任务
    ///
    /// 房间增删改广播给所有连接，成员进出只通知该房间成员。
    pub fn spawn_lifecycle_fanout(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut receiver = router.directory.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle fanout lagged, events dropped");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let (room_scope, server_event) = match event {
                    RoomLifecycleEvent::RoomCreated { room } => {
                        (None, ServerEvent::RoomCreated { room })
                    }
                    RoomLifecycleEvent::RoomUpdated { room } => {
                        (None, ServerEvent::RoomUpdated { room })
                    }
                    RoomLifecycleEvent::RoomDeleted { room_id } => {
                        (None, ServerEvent::RoomDeleted { room_id })
                    }
                    RoomLifecycleEvent::UserJoinedRoom {
                        room_id,
                        user_id,
                        username,
                    } => (
                        Some(room_id.clone()),
                        ServerEvent::UserJoinedRoom {
                            user_id,
                            username,
                            room_id,
                        },
                    ),
                    RoomLifecycleEvent::UserLeftRoom {
                        room_id,
                        user_id,
                        username,
                    } => (
                        Some(room_id.clone()),
                        ServerEvent::UserLeftRoom {
                            user_id,
                            username,
                            room_id,
                        },
                    ),
                };

                if let Err(err) = router
                    .broadcast_system_event(room_scope.as_ref(), server_event)
                    .await
                {
                    debug!(error = %err, "lifecycle fanout delivery failed");
                }
            }
        })
    }
}
