//! 主应用程序入口
//!
//! 组装各层组件并启动 Axum WebSocket 服务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use application::{
    ConnectionRegistry, MemoryChatStore, MessageRouter, RateGuard, RateGuardConfig,
    RegistryConfig, RoomDirectory, SessionConfig, SessionCoordinator,
};
use config::AppConfig;
use domain::ChatStore;
use infrastructure::{create_pg_pool, run_migrations, PgChatStore};
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 读取并校验配置
    let config = AppConfig::from_env_with_defaults();
    config.validate().context("invalid configuration")?;

    // 选择持久化后端：有 DATABASE_URL 走 PostgreSQL，否则退回内存存储
    let store: Arc<dyn ChatStore> = match &config.database.url {
        Some(url) => {
            tracing::info!(
                "连接数据库: {}",
                url.split('@').next_back().unwrap_or("unknown")
            );
            let pool = create_pg_pool(url, config.database.max_connections)
                .await
                .context("failed to create database pool")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            Arc::new(PgChatStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL 未设置，使用内存存储（仅限开发环境）");
            Arc::new(MemoryChatStore::new())
        }
    };

    let limits = &config.limits;

    // 连接登记簿
    let registry = Arc::new(ConnectionRegistry::new(RegistryConfig {
        max_connections_per_user: limits.max_connections_per_user,
    }));

    // 房间目录：预热缓存，确保默认大厅存在
    let directory = Arc::new(RoomDirectory::new(Arc::clone(&store), Arc::clone(&registry)));
    directory
        .load_rooms()
        .await
        .context("failed to warm room cache")?;

    // 限流器
    let rate_guard = Arc::new(RateGuard::new(RateGuardConfig {
        window: Duration::from_secs(limits.rate_window_secs),
        max_ops: limits.rate_max_ops,
        burst_window: Duration::from_secs(limits.burst_window_secs),
        burst_threshold: limits.burst_threshold,
    }));

    // 消息路由 + 房间生命周期事件扇出
    let message_router = Arc::new(MessageRouter::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&directory),
        Arc::clone(&rate_guard),
    ));
    message_router.spawn_lifecycle_fanout();

    // JWT 令牌校验
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    // 会话协调器
    let coordinator = Arc::new(SessionCoordinator::new(
        store,
        registry,
        directory,
        message_router,
        Arc::clone(&rate_guard),
        jwt_service,
        SessionConfig {
            heartbeat_interval: Duration::from_secs(limits.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(limits.heartbeat_timeout_secs),
            spam_mute: Duration::from_secs(limits.spam_mute_secs),
        },
    ));

    // 心跳清扫任务
    Arc::clone(&coordinator).run_heartbeat();

    // 限流窗口的周期回收
    spawn_rate_sweeper(Arc::clone(&rate_guard), Duration::from_secs(limits.rate_window_secs * 2));

    // 启动 Web 服务器
    let state = AppState::new(
        coordinator,
        Duration::from_secs(limits.heartbeat_interval_secs),
    );
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("聊天服务器启动在 http://{}", addr);
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// 周期性回收过期的限流窗口
fn spawn_rate_sweeper(rate_guard: Arc<RateGuard>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = rate_guard.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "expired rate windows swept");
            }
        }
    });
}
