//! 基础设施错误类型
//!
//! 覆盖配置加载、数据库连接与迁移等共享基础设施的失败场景，
//! 业务错误由各业务 crate 自行定义。

use thiserror::Error;

/// 基础设施错误
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("可观测性初始化失败: {0}")]
    Observability(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Observability(_) => "OBSERVABILITY_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = PlatformError::Internal("boom".to_string());
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.to_string(), "内部错误: boom");
    }

    #[test]
    fn test_is_retryable() {
        assert!(PlatformError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!PlatformError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!PlatformError::Internal("x".to_string()).is_retryable());
    }
}
