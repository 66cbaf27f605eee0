//! 分块批量写入引擎
//!
//! 任意大小的批次按固定块大小切分，每块在独立事务内执行一条多行
//! `INSERT ... ON CONFLICT DO UPDATE`，提交后才处理下一块。
//!
//! ## 失败策略
//!
//! 遇到第一个失败块即中止：失败块回滚，之前的块保持已提交，之后的块不再执行。
//! 错误中携带失败块序号与已提交的块数、行数。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument};

use adx_shared::config::RuleSyncConfig;
use adx_shared::observability::metrics;

use crate::error::{Result, SyncError};
use crate::family::RuleFamily;
use crate::models::RuleRecord;
use crate::repository::RuleRepository;

/// 单块行数上限（PostgreSQL 单条语句绑定参数上限 65535，每行 12 个参数）
pub const MAX_CHUNK_SIZE: usize = 5000;

/// 写入引擎配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertConfig {
    pub chunk_size: usize,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self { chunk_size: 500 }
    }
}

impl From<&RuleSyncConfig> for UpsertConfig {
    fn from(config: &RuleSyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
        }
    }
}

impl UpsertConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size 必须大于0".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SyncError::Config(format!(
                "chunk_size 不能超过 {}: {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// 按输入顺序切分为 `ceil(N / chunk_size)` 块
pub fn partition<T>(items: &[T], chunk_size: usize) -> Vec<&[T]> {
    items.chunks(chunk_size.max(1)).collect()
}

/// 批内按冲突键去重：保留首次出现的位置，取最后一次提交的值
///
/// 单条多行 upsert 不能两次命中同一行。
pub fn dedupe(family: RuleFamily, records: Vec<RuleRecord>) -> Vec<RuleRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<RuleRecord> = Vec::with_capacity(records.len());

    for record in records {
        let key = family.conflict_key(&record);
        match positions.get(&key) {
            Some(&pos) => unique[pos] = record,
            None => {
                positions.insert(key, unique.len());
                unique.push(record);
            }
        }
    }

    unique
}

/// 写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub family: RuleFamily,
    /// 每个已提交块的行数
    pub chunk_sizes: Vec<usize>,
    /// 去重后的行数
    pub rows: usize,
}

impl UpsertReport {
    pub fn chunk_count(&self) -> usize {
        self.chunk_sizes.len()
    }
}

/// 分块写入引擎
pub struct ChunkedUpsertEngine<R: RuleRepository> {
    repo: Arc<R>,
    config: UpsertConfig,
}

impl<R: RuleRepository> ChunkedUpsertEngine<R> {
    /// 创建引擎，块大小非法时返回配置错误
    pub fn new(repo: Arc<R>, config: UpsertConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { repo, config })
    }

    pub fn config(&self) -> UpsertConfig {
        self.config
    }

    /// 分块写入一批已编译的规则
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn upsert(&self, family: RuleFamily, records: Vec<RuleRecord>) -> Result<UpsertReport> {
        let submitted = records.len();
        let records = dedupe(family, records);
        if records.len() < submitted {
            debug!(
                submitted,
                unique = records.len(),
                "Collapsed duplicate records within batch"
            );
        }

        let chunks = partition(&records, self.config.chunk_size);
        let chunk_count = chunks.len();
        let mut chunk_sizes = Vec::with_capacity(chunk_count);
        let mut committed_rows = 0;

        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            let started = Instant::now();

            match self.repo.upsert_chunk(family, chunk).await {
                Ok(affected) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    metrics::record_upsert_chunk(family.as_str(), "success", chunk.len(), elapsed);

                    committed_rows += chunk.len();
                    chunk_sizes.push(chunk.len());
                    debug!(
                        chunk_index,
                        chunk_count,
                        rows = chunk.len(),
                        affected,
                        "Chunk committed"
                    );
                }
                Err(e) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    metrics::record_upsert_chunk(family.as_str(), "failed", chunk.len(), elapsed);

                    error!(
                        chunk_index,
                        chunk_count,
                        committed_chunks = chunk_sizes.len(),
                        committed_rows,
                        error = %e,
                        "Chunk failed, aborting batch"
                    );
                    return Err(SyncError::ChunkFailed {
                        family,
                        chunk_index,
                        chunk_count,
                        committed_chunks: chunk_sizes.len(),
                        committed_rows,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            chunks = chunk_count,
            rows = committed_rows,
            "Batch upsert completed"
        );

        Ok(UpsertReport {
            family,
            chunk_sizes,
            rows: committed_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DimensionTuple;
    use crate::repository::MockRuleRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn records(n: usize) -> Vec<RuleRecord> {
        (0..n)
            .map(|i| RuleRecord {
                rule_id: Uuid::new_v4(),
                dimensions: DimensionTuple::new("1", "a.com").with_os(format!("os{i}")),
                value: i as f64,
            })
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        let items: Vec<u32> = (0..5).collect();
        let sizes: Vec<usize> = partition(&items, 2).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(partition::<u32>(&[], 2).is_empty());
        assert_eq!(partition(&items, 10).len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(UpsertConfig::default().validate().is_ok());
        assert!(UpsertConfig::new(0).validate().is_err());
        assert!(UpsertConfig::new(MAX_CHUNK_SIZE + 1).validate().is_err());

        let config = RuleSyncConfig {
            chunk_size: 2,
            history_enabled: true,
        };
        assert_eq!(UpsertConfig::from(&config).chunk_size, 2);
    }

    #[test]
    fn test_engine_rejects_zero_chunk_size() {
        let repo = Arc::new(MockRuleRepository::new());
        let err = ChunkedUpsertEngine::new(repo, UpsertConfig::new(0)).err();
        assert!(matches!(err, Some(SyncError::Config(_))));
    }

    #[test]
    fn test_dedupe_keeps_first_position_last_value() {
        let mut batch = records(3);
        let mut dup = batch[0].clone();
        dup.value = 42.0;
        batch.push(dup);

        let unique = dedupe(RuleFamily::Floor, batch.clone());
        assert_eq!(unique.len(), 3);
        assert_eq!(unique[0].rule_id, batch[0].rule_id);
        assert_eq!(unique[0].value, 42.0);
        assert_eq!(unique[1].rule_id, batch[1].rule_id);
    }

    #[tokio::test]
    async fn test_five_records_chunk_size_two() {
        let mut repo = MockRuleRepository::new();
        repo.expect_upsert_chunk()
            .withf(|_, records| records.len() == 2)
            .times(2)
            .returning(|_, records| Ok(records.len() as u64));
        repo.expect_upsert_chunk()
            .withf(|_, records| records.len() == 1)
            .times(1)
            .returning(|_, records| Ok(records.len() as u64));

        let engine = ChunkedUpsertEngine::new(Arc::new(repo), UpsertConfig::new(2)).unwrap();
        let report = engine.upsert(RuleFamily::PriceFactor, records(5)).await.unwrap();

        assert_eq!(report.chunk_sizes, vec![2, 2, 1]);
        assert_eq!(report.rows, 5);
        assert_eq!(report.chunk_count(), 3);
    }

    #[tokio::test]
    async fn test_abort_on_first_failed_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut repo = MockRuleRepository::new();
        repo.expect_upsert_chunk().times(2).returning(move |_, records| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(records.len() as u64)
            } else {
                Err(SyncError::Database(sqlx::Error::PoolTimedOut))
            }
        });

        let engine = ChunkedUpsertEngine::new(Arc::new(repo), UpsertConfig::new(2)).unwrap();
        let err = engine
            .upsert(RuleFamily::Floor, records(5))
            .await
            .unwrap_err();

        match err {
            SyncError::ChunkFailed {
                chunk_index,
                chunk_count,
                committed_chunks,
                committed_rows,
                ..
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(chunk_count, 3);
                assert_eq!(committed_chunks, 1);
                assert_eq!(committed_rows, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let mut repo = MockRuleRepository::new();
        repo.expect_upsert_chunk().never();

        let engine = ChunkedUpsertEngine::new(Arc::new(repo), UpsertConfig::default()).unwrap();
        let report = engine.upsert(RuleFamily::Dpo, vec![]).await.unwrap();
        assert_eq!(report.chunk_count(), 0);
    }
}
