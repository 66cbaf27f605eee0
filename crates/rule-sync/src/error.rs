//! 规则同步错误类型

use thiserror::Error;
use uuid::Uuid;

use crate::family::RuleFamily;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("配置无效: {0}")]
    Config(String),

    #[error("规则未找到: {family} rule_id={rule_id}")]
    RuleNotFound { family: RuleFamily, rule_id: Uuid },

    /// 分块写入中途失败：失败块已回滚，之前的块已提交，之后的块未执行
    #[error(
        "分块写入失败: {family} chunk_index={chunk_index}/{chunk_count}, 已提交 {committed_chunks} 块 {committed_rows} 行"
    )]
    ChunkFailed {
        family: RuleFamily,
        chunk_index: usize,
        chunk_count: usize,
        committed_chunks: usize,
        committed_rows: usize,
        #[source]
        source: Box<SyncError>,
    },

    /// 规则已落库但元数据未发布成功
    #[error("元数据发布失败: keys={failed_keys:?}, 成功 {published} 个")]
    PublishFailed {
        failed_keys: Vec<String>,
        published: usize,
        #[source]
        source: Box<SyncError>,
    },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::RuleNotFound { .. } => "RULE_NOT_FOUND",
            Self::ChunkFailed { .. } => "CHUNK_FAILED",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 调用方重新提交是否可能成功
    ///
    /// 本模块内部从不重试，该判断只提供给调用方。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::ChunkFailed { source, .. } | Self::PublishFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for SyncError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}
