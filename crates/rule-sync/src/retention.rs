//! 制品保留策略
//!
//! 分发表只追加，按需清理：每个 key 保留最新的 N 个制品（N >= 1），
//! 因此任何 key 的当前制品都不会被删除。

use std::sync::Arc;

use tracing::{info, instrument};

use adx_shared::observability::metrics;

use crate::error::{Result, SyncError};
use crate::repository::ArtifactStore;

pub struct ArtifactRetention<A: ArtifactStore> {
    store: Arc<A>,
}

impl<A: ArtifactStore> ArtifactRetention<A> {
    pub fn new(store: Arc<A>) -> Self {
        Self { store }
    }

    /// 清理旧制品，返回删除数
    #[instrument(skip(self))]
    pub async fn compact(&self, keep_latest: usize) -> Result<u64> {
        if keep_latest == 0 {
            return Err(SyncError::Validation(
                "keep_latest 必须大于0，否则会删除当前制品".to_string(),
            ));
        }

        let deleted = self.store.compact(keep_latest).await?;
        metrics::record_compaction(deleted);
        info!(deleted, keep_latest, "Metadata artifacts compacted");

        Ok(deleted)
    }
}
