//! 数据库连接与存储实现

mod pg_store;

pub use pg_store::PgChatStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// 创建 PostgreSQL 连接池
pub async fn create_pg_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    info!(max_connections, "database pool created");
    Ok(pool)
}

/// 执行数据库迁移
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}
