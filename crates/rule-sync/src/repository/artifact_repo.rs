//! 元数据分发存储
//!
//! 制品只追加不修改。同一分组键的发布通过事务级 advisory lock 串行化，
//! 读取生效规则与追加制品在同一事务内完成。

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::rule_repo::select_columns;
use super::traits::{ArtifactStore, PublishSession};
use crate::error::{Result, SyncError};
use crate::models::{GroupingKey, MetadataArtifact, NewArtifact, TargetingRule};

/// 分组键对应的 advisory lock ID（SHA-256 前 8 字节）
pub(crate) fn advisory_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// PostgreSQL 元数据分发存储
#[derive(Clone)]
pub struct PgArtifactStore {
    pool: PgPool,
}

impl PgArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactStore for PgArtifactStore {
    async fn begin_publish(&self, key: &GroupingKey) -> Result<Box<dyn PublishSession>> {
        let mut tx = self.pool.begin().await?;

        let lock_id = advisory_lock_id(&key.as_key());
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_id)
            .execute(&mut *tx)
            .await?;
        debug!(key = %key, lock_id, "Publish lock acquired");

        Ok(Box::new(PgPublishSession {
            tx: Some(tx),
            key: key.clone(),
        }))
    }

    async fn latest(&self, key: &str) -> Result<Option<MetadataArtifact>> {
        let artifact = sqlx::query_as::<_, MetadataArtifact>(
            r#"
            SELECT transaction_id, key, value, version, created_at
            FROM metadata_queue
            WHERE key = $1
            ORDER BY created_at DESC, transaction_id DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(artifact)
    }

    async fn compact(&self, keep_latest: usize) -> Result<u64> {
        if keep_latest == 0 {
            return Err(SyncError::Validation("keep_latest 必须大于0".to_string()));
        }

        let result = sqlx::query(
            r#"
            DELETE FROM metadata_queue
            WHERE transaction_id IN (
                SELECT transaction_id FROM (
                    SELECT transaction_id,
                           ROW_NUMBER() OVER (
                               PARTITION BY key ORDER BY created_at DESC, transaction_id DESC
                           ) AS rn
                    FROM metadata_queue
                ) ranked
                WHERE rn > $1
            )
            "#,
        )
        .bind(keep_latest as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// 持有 advisory lock 的发布事务，事务结束（提交或回滚）时锁自动释放
pub struct PgPublishSession {
    tx: Option<Transaction<'static, Postgres>>,
    key: GroupingKey,
}

impl PgPublishSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| SyncError::Internal(format!("发布会话已结束: {}", self.key)))
    }
}

#[async_trait]
impl PublishSession for PgPublishSession {
    async fn load_active_rules(&mut self) -> Result<Vec<TargetingRule>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM {}
            WHERE publisher = $1 AND domain = $2 AND active
              AND (device_type IS NULL OR (device_type = 'mobile') = $3)
            ORDER BY seq
            "#,
            select_columns(self.key.family),
            self.key.family.table()
        );
        let publisher = self.key.publisher.clone();
        let domain = self.key.domain.clone();
        let mobile = self.key.mobile;

        let tx = self.tx()?;
        let rules = sqlx::query_as::<_, TargetingRule>(&sql)
            .bind(publisher)
            .bind(domain)
            .bind(mobile)
            .fetch_all(&mut **tx)
            .await?;

        Ok(rules)
    }

    async fn append(&mut self, artifact: NewArtifact) -> Result<MetadataArtifact> {
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| SyncError::Internal(format!("发布会话已结束: {}", self.key)))?;

        // created_at 取加锁之后的时钟，保证同一 key 后发布者时间更晚
        let stored = sqlx::query_as::<_, MetadataArtifact>(
            r#"
            INSERT INTO metadata_queue (transaction_id, key, value, created_at)
            VALUES ($1, $2, $3, clock_timestamp())
            RETURNING transaction_id, key, value, version, created_at
            "#,
        )
        .bind(artifact.transaction_id)
        .bind(&artifact.key)
        .bind(&artifact.value)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_is_stable_per_key() {
        let a = advisory_lock_id("floor:1:a.com:1");
        assert_eq!(a, advisory_lock_id("floor:1:a.com:1"));
        assert_ne!(a, advisory_lock_id("floor:1:a.com:0"));
    }
}
