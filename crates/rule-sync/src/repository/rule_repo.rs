//! 规则仓储
//!
//! 五个规则族表结构相同，表名与数值列由 [`RuleFamily`] 决定。

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::traits::RuleRepository;
use crate::error::Result;
use crate::family::{ConflictTarget, RuleFamily};
use crate::models::{RuleRecord, TargetingRule};

/// 查询列，数值列统一别名为 value
pub(crate) fn select_columns(family: RuleFamily) -> String {
    format!(
        "rule_id, publisher, domain, country, os, device_type, placement_type, browser, \
         {} AS value, active, created_at, updated_at",
        family.value_field()
    )
}

/// ON CONFLICT 目标
///
/// 自然键约束声明了 NULLS NOT DISTINCT，直接按约束名指定。
fn conflict_clause(family: RuleFamily) -> String {
    match family.conflict_target() {
        ConflictTarget::RuleId => format!("({})", ConflictTarget::RuleId.columns()),
        ConflictTarget::NaturalKey => format!("ON CONSTRAINT uq_{}_natural", family.table()),
    }
}

fn upsert_builder(family: RuleFamily, records: &[RuleRecord]) -> QueryBuilder<'static, Postgres> {
    let column = family.value_field();
    let now = Utc::now();

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} (rule_id, publisher, domain, country, os, device_type, placement_type, \
         browser, {}, active, created_at, updated_at) ",
        family.table(),
        column
    ));

    builder.push_values(records, |mut row, record| {
        let d = &record.dimensions;
        row.push_bind(record.rule_id)
            .push_bind(d.publisher.clone())
            .push_bind(d.domain.clone())
            .push_bind(d.country.clone())
            .push_bind(d.os.clone())
            .push_bind(d.device.clone())
            .push_bind(d.placement_type.clone())
            .push_bind(d.browser.clone())
            .push_bind(record.value)
            .push_bind(true)
            .push_bind(now)
            .push_bind(now);
    });

    let target = conflict_clause(family);
    builder.push(format!(
        " ON CONFLICT {target} DO UPDATE SET {column} = EXCLUDED.{column}, \
         active = EXCLUDED.active, updated_at = EXCLUDED.updated_at"
    ));

    builder
}

/// PostgreSQL 规则仓储
#[derive(Clone)]
pub struct PgRuleRepository {
    pool: PgPool,
}

impl PgRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for PgRuleRepository {
    async fn upsert_chunk(&self, family: RuleFamily, records: &[RuleRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let result = upsert_builder(family, records)
            .build()
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn fetch_by_ids(&self, family: RuleFamily, ids: &[Uuid]) -> Result<Vec<TargetingRule>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE rule_id = ANY($1) ORDER BY seq",
            select_columns(family),
            family.table()
        );
        let rules = sqlx::query_as::<_, TargetingRule>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rules)
    }

    async fn deactivate(&self, family: RuleFamily, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET active = FALSE, updated_at = NOW() WHERE rule_id = ANY($1) AND active",
            family.table()
        );
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}
