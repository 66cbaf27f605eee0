//! 数据访问层
//!
//! - 仓储只负责持久化，不包含业务逻辑
//! - PostgreSQL 实现基于 SQLx，内存实现用于测试与本地演练
//! - 每个分块写入与每次发布各自占用一个事务

mod artifact_repo;
mod history_repo;
pub mod memory;
mod rule_repo;
mod traits;

pub use artifact_repo::PgArtifactStore;
pub use history_repo::PgHistoryRepository;
pub use memory::MemoryStore;
pub use rule_repo::PgRuleRepository;
pub use traits::*;
