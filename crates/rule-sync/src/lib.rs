//! 定向规则编译与同步引擎
//!
//! 将运营编辑的定价与定向规则编译为确定性的规则 ID，按固定块大小事务写入，
//! 并为每个受影响的分组键重新生成按特异度排序的规则集，追加到分发表供竞价引擎读取。
//!
//! ## 模块
//!
//! - [`compiler`]：维度元组 -> 规范公式 -> 规则 ID
//! - [`ranker`]：按特异度稳定排序
//! - [`upsert`]：分块批量写入
//! - [`publisher`]：元数据发布
//! - [`history`]：变更历史
//! - [`service`]：同步流程编排
//! - [`retention`]：旧制品清理

pub mod cli;
pub mod compiler;
pub mod dto;
pub mod error;
pub mod family;
pub mod history;
pub mod models;
pub mod publisher;
pub mod ranker;
pub mod repository;
pub mod retention;
pub mod service;
pub mod upsert;

pub use dto::RuleInput;
pub use error::{Result, SyncError};
pub use family::RuleFamily;
pub use models::{DimensionTuple, GroupingKey, MetadataArtifact, TargetingRule};
pub use service::{RuleSyncService, SyncReport};
