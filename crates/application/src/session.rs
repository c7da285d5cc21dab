//! 会话协调
//!
//! 把连接生命周期事件接到各组件上：认证、进出房间、发消息、
//! 发言审批、心跳驱逐。所有错误只回报给发起请求的连接。
//! 主动断开与心跳超时共用同一条清理路径。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use domain::{ChatStore, ConnectionId, MessageKind, RoomId, UserId};

use crate::connection_registry::ConnectionRegistry;
use crate::error::{ChatError, ChatResult};
use crate::message_router::MessageRouter;
use crate::mic_control::MicController;
use crate::protocol::{ClientEvent, ServerEvent, UserSummary};
use crate::rate_guard::{OpClass, RateGuard};
use crate::room_directory::RoomDirectory;

/// 令牌校验接口，由 web 层的 JWT 服务实现
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> ChatResult<UserId>;
}

/// 会话协调配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 心跳清扫间隔
    pub heartbeat_interval: Duration,
    /// 无活动判死时限
    pub heartbeat_timeout: Duration,
    /// 刷屏处罚的临时禁言时长
    pub spam_mute: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            spam_mute: Duration::from_secs(300),
        }
    }
}

/// 会话协调器
pub struct SessionCoordinator {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RoomDirectory>,
    router: Arc<MessageRouter>,
    mic: MicController,
    rate_guard: Arc<RateGuard>,
    verifier: Arc<dyn TokenVerifier>,
    config: SessionConfig,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RoomDirectory>,
        router: Arc<MessageRouter>,
        rate_guard: Arc<RateGuard>,
        verifier: Arc<dyn TokenVerifier>,
        config: SessionConfig,
    ) -> Self {
        let mic = MicController::new(Arc::clone(&directory));
        Self {
            store,
            registry,
            directory,
            router,
            mic,
            rate_guard,
            verifier,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// 处理一个入站事件，错误以 `error` 事件回给本连接
    pub async fn handle_event(
        &self,
        connection_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<ServerEvent>,
        event: ClientEvent,
    ) {
        let result = match event {
            ClientEvent::Authenticate { token } => {
                self.authenticate(connection_id, outbound, &token).await
            }
            ClientEvent::Ping => {
                self.registry.touch(connection_id);
                let _ = outbound.send(ServerEvent::Pong {
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            other => match self.registry.user_of(connection_id) {
                None => Err(ChatError::NotAuthenticated),
                Some(user) => {
                    self.registry.touch(connection_id);
                    self.dispatch(connection_id, &user, other).await
                }
            },
        };

        if let Err(err) = result {
            if matches!(err, ChatError::SpamDetected) {
                self.apply_spam_mute(connection_id);
            }
            if err.is_client_fault() {
                debug!(connection_id = %connection_id, code = err.code(), "request rejected");
            } else {
                error!(connection_id = %connection_id, error = %err, "request failed");
            }
            let _ = outbound.send(ServerEvent::from_error(&err));
        }
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        user: &UserSummary,
        event: ClientEvent,
    ) -> ChatResult<()> {
        match event {
            ClientEvent::JoinRoom { room_id, password } => {
                self.join_room(connection_id, user, &room_id, password.as_deref())
                    .await
            }
            ClientEvent::LeaveRoom { room_id } => {
                self.leave_room(connection_id, user, &room_id).await
            }
            ClientEvent::Message {
                content,
                room_id,
                receiver_id,
                kind,
            } => {
                self.handle_message(connection_id, user, &content, room_id, receiver_id, kind)
                    .await
            }
            ClientEvent::Typing { is_typing } => {
                self.handle_typing(connection_id, user, is_typing).await
            }
            ClientEvent::RequestMic { room_id } => {
                self.request_mic(user, &room_id).await
            }
            ClientEvent::ApproveMic { room_id, user_id } => {
                self.moderate_mic(user, &room_id, user_id, MicAction::Approve)
                    .await
            }
            ClientEvent::RejectMic { room_id, user_id } => {
                self.moderate_mic(user, &room_id, user_id, MicAction::Reject)
                    .await
            }
            ClientEvent::RemoveSpeaker { room_id, user_id } => {
                self.moderate_mic(user, &room_id, user_id, MicAction::Remove)
                    .await
            }
            // 已在上层处理
            ClientEvent::Authenticate { .. } | ClientEvent::Ping => Ok(()),
        }
    }

    /// 认证流程：验令牌 → 取用户 → 注册连接 → 加入默认房间 →
    /// 回发 `authenticated` 和房间快照
    async fn authenticate(
        &self,
        connection_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<ServerEvent>,
        token: &str,
    ) -> ChatResult<()> {
        if self.registry.user_of(connection_id).is_some() {
            return Err(ChatError::InvalidContent(
                "connection already authenticated".to_string(),
            ));
        }

        let user_id = self.verifier.verify(token)?;
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(ChatError::NotAuthenticated)?;

        let now = Utc::now();
        if user.is_ban_active(now) {
            warn!(user_id = %user.id, "banned user rejected");
            return Err(ChatError::AccessDenied);
        }

        let summary = UserSummary::from(&user);
        self.registry
            .register(connection_id, summary.clone(), outbound.clone())?;

        let general = RoomId::general();
        let room = match self.directory.join(&summary, &general, None).await {
            Ok(room) => room,
            Err(err) => {
                // 认证流程断在中间，把注册也回退掉
                self.registry.unregister(connection_id);
                return Err(err);
            }
        };
        self.registry
            .set_current_room(connection_id, Some(general.clone()));

        // 整条认证链成功后才异步落库在线标记，失败只记日志，不阻塞认证
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.set_user_online_status(user_id, true).await {
                error!(user_id = %user_id, error = %err, "online status write failed");
            }
        });

        let _ = outbound.send(ServerEvent::Authenticated {
            user: summary.clone(),
        });
        let _ = outbound.send(ServerEvent::RoomJoined {
            room,
            online_users: self.registry.users_in_room(&general),
        });

        info!(user_id = %summary.id, connection_id = %connection_id, "connection authenticated");
        Ok(())
    }

    async fn join_room(
        &self,
        connection_id: ConnectionId,
        user: &UserSummary,
        room_id: &RoomId,
        password: Option<&str>,
    ) -> ChatResult<()> {
        self.check_rate(user.id, OpClass::RoomAction)?;

        let room = self.directory.join(user, room_id, password).await?;

        let previous = self.registry.current_room(connection_id);
        self.registry
            .set_current_room(connection_id, Some(room_id.clone()));

        // 切房：旧房间的在场通知，该用户在旧房间无其他连接时才发
        if let Some(previous) = previous {
            if previous != *room_id && !self.registry.user_present_in_room(user.id, &previous) {
                let left = ServerEvent::UserLeftRoom {
                    user_id: user.id,
                    username: user.username.clone(),
                    room_id: previous.clone(),
                };
                if let Err(err) = self.router.broadcast_system_event(Some(&previous), left).await {
                    debug!(room_id = %previous, error = %err, "room switch notification failed");
                }
            }
        }

        self.registry.send_to_connection(
            connection_id,
            ServerEvent::RoomJoined {
                online_users: self.registry.users_in_room(room_id),
                room,
            },
        );
        Ok(())
    }

    async fn leave_room(
        &self,
        connection_id: ConnectionId,
        user: &UserSummary,
        room_id: &RoomId,
    ) -> ChatResult<()> {
        self.check_rate(user.id, OpClass::RoomAction)?;

        self.directory.leave(user, room_id).await?;
        if self.registry.current_room(connection_id).as_ref() == Some(room_id) {
            self.registry.set_current_room(connection_id, None);
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        connection_id: ConnectionId,
        user: &UserSummary,
        content: &str,
        room_id: Option<RoomId>,
        receiver_id: Option<UserId>,
        kind: MessageKind,
    ) -> ChatResult<()> {
        if self.registry.is_muted(user.id, Utc::now()) {
            return Err(ChatError::SpamDetected);
        }

        match (room_id, receiver_id) {
            (Some(room_id), None) => {
                self.router
                    .send_room_message(connection_id, &room_id, content, kind)
                    .await?;
            }
            (None, Some(receiver_id)) => {
                self.router
                    .send_direct_message(connection_id, receiver_id, content, kind)
                    .await?;
            }
            _ => {
                return Err(ChatError::InvalidContent(
                    "exactly one of roomId and receiverId must be set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// 输入指示：只在当前房间内扇出，不持久化、不限流
    async fn handle_typing(
        &self,
        connection_id: ConnectionId,
        user: &UserSummary,
        is_typing: bool,
    ) -> ChatResult<()> {
        let Some(room_id) = self.registry.current_room(connection_id) else {
            return Ok(());
        };
        self.router
            .broadcast_system_event(
                Some(&room_id),
                ServerEvent::UserTyping {
                    user_id: user.id,
                    username: user.username.clone(),
                    is_typing,
                    room_id: room_id.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn request_mic(&self, user: &UserSummary, room_id: &RoomId) -> ChatResult<()> {
        self.check_rate(user.id, OpClass::MicAction)?;

        let queued = self.mic.request_mic(room_id, user.id).await?;
        if queued {
            self.router
                .broadcast_system_event(
                    Some(room_id),
                    ServerEvent::MicRequested {
                        user_id: user.id,
                        room_id: room_id.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// 主持人/特权用户的发言审批操作
    async fn moderate_mic(
        &self,
        actor: &UserSummary,
        room_id: &RoomId,
        target: UserId,
        action: MicAction,
    ) -> ChatResult<()> {
        let room = self.directory.get_room(room_id).await?;
        if !room.is_host(actor.id) && !actor.role.is_privileged() {
            return Err(ChatError::PermissionDenied);
        }

        let (changed, event) = match action {
            MicAction::Approve => (
                self.mic.approve(room_id, target).await?,
                ServerEvent::MicApproved {
                    user_id: target,
                    room_id: room_id.clone(),
                },
            ),
            MicAction::Reject => (
                self.mic.reject(room_id, target).await?,
                ServerEvent::MicRejected {
                    user_id: target,
                    room_id: room_id.clone(),
                },
            ),
            MicAction::Remove => (
                self.mic.remove_speaker(room_id, target).await?,
                ServerEvent::SpeakerRemoved {
                    user_id: target,
                    room_id: room_id.clone(),
                },
            ),
        };

        if changed {
            self.router
                .broadcast_system_event(Some(room_id), event)
                .await?;
        }
        Ok(())
    }

    /// 断开清理：注销连接、在场通知、最后一条连接时异步落库下线
    ///
    /// 主动断开与心跳驱逐都走这里，行为一致。
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(summary) = self.registry.unregister(connection_id) else {
            return;
        };
        let user = summary.user;

        if let Some(room_id) = summary.current_room {
            // 同一用户在该房间还有别的连接时不发离开通知
            if !self.registry.user_present_in_room(user.id, &room_id) {
                let left = ServerEvent::UserLeftRoom {
                    user_id: user.id,
                    username: user.username.clone(),
                    room_id: room_id.clone(),
                };
                if let Err(err) = self.router.broadcast_system_event(Some(&room_id), left).await {
                    debug!(room_id = %room_id, error = %err, "leave notification failed");
                }
            }
        }

        if summary.last_connection {
            let store = Arc::clone(&self.store);
            let user_id = user.id;
            tokio::spawn(async move {
                if let Err(err) = store.set_user_online_status(user_id, false).await {
                    error!(user_id = %user_id, error = %err, "offline status write failed");
                }
            });
            info!(user_id = %user.id, "user went offline");
        }
        debug!(connection_id = %connection_id, "connection closed");
    }

    /// 心跳清扫任务：周期性驱逐超时连接
    pub fn run_heartbeat(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                let expired = self.registry.expired(self.config.heartbeat_timeout);
                if expired.is_empty() {
                    continue;
                }
                warn!(count = expired.len(), "evicting timed out connections");
                for connection_id in expired {
                    self.registry.send_to_connection(
                        connection_id,
                        ServerEvent::Kicked {
                            reason: "heartbeat timeout".to_string(),
                        },
                    );
                    self.disconnect(connection_id).await;
                }
            }
        })
    }

    fn check_rate(&self, user_id: UserId, class: OpClass) -> ChatResult<()> {
        let decision = self.rate_guard.check(user_id, class);
        if decision.spam_burst {
            return Err(ChatError::SpamDetected);
        }
        if !decision.allowed {
            return Err(ChatError::RateLimitExceeded {
                reset_in_ms: decision.reset_in_ms,
            });
        }
        Ok(())
    }

    fn apply_spam_mute(&self, connection_id: ConnectionId) {
        let Some(user) = self.registry.user_of(connection_id) else {
            return;
        };
        let now = Utc::now();
        // 已在禁言中的不再延长
        if self.registry.is_muted(user.id, now) {
            return;
        }
        let until = now
            + chrono::Duration::from_std(self.config.spam_mute)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        warn!(user_id = %user.id, %until, "temporary mute applied after spam burst");
        self.registry.mute_user(user.id, until);
    }
}

enum MicAction {
    Approve,
    Reject,
    Remove,
}
