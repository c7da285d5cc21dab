use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use application::{ChatError, ClientEvent, ServerEvent};
use domain::ConnectionId;

use crate::state::AppState;

/// WebSocket 连接管理器
///
/// 封装单个 WebSocket 连接的生命周期：
/// - 入站帧解析与分发
/// - 出站事件序列化与发送
/// - 服务端主动 ping 与 pong 回应
/// - 断开时的资源清理
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self { socket, state }
    }

    /// 运行 WebSocket 连接的主循环
    pub async fn run(self) {
        let connection_id = ConnectionId::generate();
        let state = self.state;
        tracing::info!(connection_id = %connection_id, "WebSocket 连接已建立");

        let (mut ws_tx, mut ws_rx) = self.socket.split();

        // 出站事件通道：协调器和本层都往这里写
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
        // 写命令通道：统一所有对 sender 的写操作
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：事件序列化、协议层 ping/pong
        let ping_interval = state.ping_interval;
        let send_task = tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendPong(data) => {
                            if ws_tx.send(WsMessage::Pong(data.into())).await.is_err() {
                                break;
                            }
                        }
                    },
                    maybe_event = event_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        let payload = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to serialize websocket payload");
                                continue;
                            }
                        };
                        if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        // 接收循环：解析入站帧并交给协调器
        while let Some(Ok(frame)) = ws_rx.next().await {
            match frame {
                WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => {
                        state
                            .coordinator
                            .handle_event(connection_id, &event_tx, event)
                            .await;
                    }
                    Err(err) => {
                        // 形状不符的载荷在边界处直接拒绝
                        tracing::debug!(connection_id = %connection_id, error = %err, "malformed payload");
                        let error = ChatError::InvalidContent("malformed event payload".to_string());
                        if event_tx.send(ServerEvent::from_error(&error)).is_err() {
                            break;
                        }
                    }
                },
                WsMessage::Ping(data) => {
                    state.coordinator.registry().touch(connection_id);
                    if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    state.coordinator.registry().touch(connection_id);
                }
                WsMessage::Close(_) => {
                    tracing::debug!(connection_id = %connection_id, "WebSocket收到关闭消息");
                    break;
                }
                WsMessage::Binary(_) => {
                    tracing::debug!(connection_id = %connection_id, "binary frames are not supported");
                }
            }
        }

        // 主动断开与心跳驱逐共用同一条清理路径
        state.coordinator.disconnect(connection_id).await;
        send_task.abort();
        tracing::info!(connection_id = %connection_id, "WebSocket连接已断开");
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Vec<u8>),
}
