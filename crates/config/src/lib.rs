//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 数据库连接（未设置时退回内存存储）
//! - JWT认证
//! - 连接与限流阈值
//! - 服务设置

use serde::{Deserialize, Serialize};
use std::env;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 数据库配置
    pub database: DatabaseConfig,
    /// JWT认证配置
    pub jwt: JwtConfig,
    /// 连接与限流阈值
    pub limits: LimitsConfig,
    /// 服务配置
    pub server: ServerConfig,
}

/// 数据库配置
///
/// `url` 为空时进程使用内存存储，仅适用于开发和测试。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

/// 连接与限流阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 每用户并发连接上限
    pub max_connections_per_user: usize,
    /// 主限流窗口长度（秒）
    pub rate_window_secs: u64,
    /// 主窗口内允许的操作数
    pub rate_max_ops: u32,
    /// 刷屏检测窗口长度（秒）
    pub burst_window_secs: u64,
    /// 刷屏检测阈值
    pub burst_threshold: u32,
    /// 心跳清扫间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 无活动判死时限（秒）
    pub heartbeat_timeout_secs: u64,
    /// 刷屏处罚的禁言时长（秒）
    pub spam_mute_secs: u64,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置
    /// JWT_SECRET 缺失时 panic，确保生产环境不会落到不安全的默认值
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
                max_connections: env_parse("DB_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .expect("JWT_SECRET environment variable is required for production safety"),
                expiration_hours: env_parse("JWT_EXPIRATION_HOURS", 24),
            },
            limits: LimitsConfig::from_env(),
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("SERVER_PORT", 8080),
            },
        }
    }

    /// 从环境变量加载配置，开发环境版本
    /// 提供不安全的默认值，仅用于测试和开发
    pub fn from_env_with_defaults() -> Self {
        Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
                max_connections: env_parse("DB_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET").unwrap_or_else(|_| {
                    "dev-secret-key-not-for-production-use-minimum-32-chars".to_string()
                }),
                expiration_hours: env_parse("JWT_EXPIRATION_HOURS", 24),
            },
            limits: LimitsConfig::from_env(),
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("SERVER_PORT", 8080),
            },
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证JWT密钥长度（至少256位/32字节）
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        if let Some(url) = &self.database.url {
            if url.is_empty() {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "Database URL cannot be empty".to_string(),
                ));
            }
            if self.database.max_connections == 0 {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "Max connections must be greater than 0".to_string(),
                ));
            }
        }

        if self.limits.max_connections_per_user == 0 {
            return Err(ConfigError::InvalidLimitsConfig(
                "max connections per user must be at least 1".to_string(),
            ));
        }
        if self.limits.rate_max_ops == 0 || self.limits.rate_window_secs == 0 {
            return Err(ConfigError::InvalidLimitsConfig(
                "rate window must allow at least 1 op".to_string(),
            ));
        }
        if self.limits.heartbeat_timeout_secs <= self.limits.heartbeat_interval_secs {
            return Err(ConfigError::InvalidLimitsConfig(
                "heartbeat timeout must be longer than the sweep interval".to_string(),
            ));
        }

        Ok(())
    }
}

impl LimitsConfig {
    fn from_env() -> Self {
        Self {
            max_connections_per_user: env_parse("MAX_CONNECTIONS_PER_USER", 3),
            rate_window_secs: env_parse("RATE_WINDOW_SECS", 60),
            rate_max_ops: env_parse("RATE_MAX_OPS", 30),
            burst_window_secs: env_parse("BURST_WINDOW_SECS", 10),
            burst_threshold: env_parse("BURST_THRESHOLD", 10),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 25),
            heartbeat_timeout_secs: env_parse("HEARTBEAT_TIMEOUT_SECS", 60),
            spam_mute_secs: env_parse("SPAM_MUTE_SECS", 300),
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid limits configuration: {0}")]
    InvalidLimitsConfig(String),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),
}

impl Default for AppConfig {
    /// 默认配置使用开发环境版本
    fn default() -> Self {
        Self::from_env_with_defaults()
    }
}
