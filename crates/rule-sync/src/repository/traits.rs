//! 仓储 Trait 定义
//!
//! 服务层只依赖这些接口，PostgreSQL 与内存实现均可注入，规则仓储与历史仓储支持 mock 测试

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::family::RuleFamily;
use crate::history::HistoryEntry;
use crate::models::{GroupingKey, MetadataArtifact, NewArtifact, RuleRecord, TargetingRule};

/// 规则仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// 在一个独立事务中写入一块规则，返回写入行数
    ///
    /// 冲突时只更新数值、active 与 updated_at，规则 ID 与 created_at 保持不变。
    async fn upsert_chunk(&self, family: RuleFamily, records: &[RuleRecord]) -> Result<u64>;

    /// 按 ID 批量读取（含已软删除的行）
    async fn fetch_by_ids(&self, family: RuleFamily, ids: &[Uuid]) -> Result<Vec<TargetingRule>>;

    /// 软删除，返回实际由 active 变为 inactive 的行数
    async fn deactivate(&self, family: RuleFamily, ids: &[Uuid]) -> Result<u64>;
}

/// 变更历史仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn insert(&self, entry: &HistoryEntry) -> Result<()>;
}

/// 元数据分发存储接口
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// 开启一次发布，持有该分组键的锁直到会话结束
    async fn begin_publish(&self, key: &GroupingKey) -> Result<Box<dyn PublishSession>>;

    /// 读取 key 的当前制品
    async fn latest(&self, key: &str) -> Result<Option<MetadataArtifact>>;

    /// 每个 key 保留最新的 `keep_latest` 个制品，返回删除数
    async fn compact(&self, keep_latest: usize) -> Result<u64>;
}

/// 单个分组键的发布会话
///
/// 读取与追加在同一把锁下完成；会话未追加就被丢弃时释放锁且不写入任何内容。
#[async_trait]
pub trait PublishSession: Send {
    /// 读取该分组键下所有生效规则，按存储顺序返回
    async fn load_active_rules(&mut self) -> Result<Vec<TargetingRule>>;

    /// 追加新制品并结束会话
    async fn append(&mut self, artifact: NewArtifact) -> Result<MetadataArtifact>;
}
