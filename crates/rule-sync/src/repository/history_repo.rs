//! 变更历史仓储

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::traits::HistoryRepository;
use crate::error::Result;
use crate::history::HistoryEntry;

/// PostgreSQL 变更历史仓储
#[derive(Clone)]
pub struct PgHistoryRepository {
    pool: PgPool,
}

impl PgHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for PgHistoryRepository {
    async fn insert(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_history (actor, action, subject, item, rule_id, changes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(&entry.subject)
        .bind(&entry.item)
        .bind(entry.rule_id)
        .bind(Json(&entry.changes))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
