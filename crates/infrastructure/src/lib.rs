//! 基础设施层：PostgreSQL 持久化实现

pub mod db;

pub use db::{create_pg_pool, run_migrations, PgChatStore};
