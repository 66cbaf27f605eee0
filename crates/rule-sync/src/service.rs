//! 规则同步服务
//!
//! 串联编译、分块写入、变更历史与元数据发布：
//!
//! 1. 参数校验 -> 2. 编译规则 ID -> 3. 读取写入前快照 -> 4. 分块写入
//! -> 5. 记录变更历史 -> 6. 对每个受影响的分组键各发布一次
//!
//! 分块写入失败时整批中止且不发布；某个分组键发布失败时其余键照常发布，
//! 最后统一报告失败的键。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use adx_shared::config::RuleSyncConfig;

use crate::compiler;
use crate::dto::RuleInput;
use crate::error::{Result, SyncError};
use crate::family::RuleFamily;
use crate::history::ChangeHistoryRecorder;
use crate::models::{GroupingKey, MetadataArtifact, RuleRecord, TargetingRule};
use crate::publisher::MetadataPublisher;
use crate::repository::{
    ArtifactStore, HistoryRepository, PgArtifactStore, PgHistoryRepository, PgRuleRepository,
    RuleRepository,
};
use crate::upsert::{ChunkedUpsertEngine, UpsertConfig};

/// 一个分组键的发布结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedKey {
    pub key: String,
    pub transaction_id: Uuid,
    pub rules: usize,
}

impl From<&MetadataArtifact> for PublishedKey {
    fn from(artifact: &MetadataArtifact) -> Self {
        Self {
            key: artifact.key.clone(),
            transaction_id: artifact.transaction_id,
            rules: artifact.rule_count(),
        }
    }
}

/// 一次同步操作的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// 写入（去重后）的行数
    pub rows_written: usize,
    /// 每个已提交块的行数
    pub chunk_sizes: Vec<usize>,
    /// 实际被软删除的行数
    pub deactivated: usize,
    pub history_entries: usize,
    pub published: Vec<PublishedKey>,
}

/// 规则同步服务
pub struct RuleSyncService<R = PgRuleRepository, A = PgArtifactStore, H = PgHistoryRepository>
where
    R: RuleRepository,
    A: ArtifactStore,
    H: HistoryRepository,
{
    rules: Arc<R>,
    engine: ChunkedUpsertEngine<R>,
    publisher: MetadataPublisher<A>,
    recorder: ChangeHistoryRecorder<H>,
}

impl RuleSyncService {
    /// 基于 PostgreSQL 连接池构建服务
    pub fn with_pool(pool: PgPool, config: &RuleSyncConfig) -> Result<Self> {
        Self::new(
            Arc::new(PgRuleRepository::new(pool.clone())),
            Arc::new(PgArtifactStore::new(pool.clone())),
            Arc::new(PgHistoryRepository::new(pool)),
            config,
        )
    }
}

impl<R, A, H> RuleSyncService<R, A, H>
where
    R: RuleRepository,
    A: ArtifactStore,
    H: HistoryRepository,
{
    pub fn new(
        rules: Arc<R>,
        artifacts: Arc<A>,
        history: Arc<H>,
        config: &RuleSyncConfig,
    ) -> Result<Self> {
        let engine = ChunkedUpsertEngine::new(rules.clone(), UpsertConfig::from(config))?;

        Ok(Self {
            rules,
            engine,
            publisher: MetadataPublisher::new(artifacts),
            recorder: ChangeHistoryRecorder::new(history, config.history_enabled),
        })
    }

    pub fn artifacts(&self) -> &Arc<A> {
        self.publisher.store()
    }

    /// 批量写入规则并发布受影响的分组键
    #[instrument(skip(self, inputs), fields(inputs = inputs.len()))]
    pub async fn upsert_rules(
        &self,
        actor: &str,
        family: RuleFamily,
        inputs: Vec<RuleInput>,
    ) -> Result<SyncReport> {
        // 1-2. 校验与编译，任何一条不合法都不写入
        let records = compile_inputs(family, &inputs)?;
        if records.is_empty() {
            return Ok(SyncReport::default());
        }
        self.verify_supplied_ids(family, &inputs, &records).await?;

        let ids = unique_ids(records.iter().map(|r| r.rule_id));
        let keys: BTreeSet<GroupingKey> = records
            .iter()
            .flat_map(|r| GroupingKey::for_rule(family, &r.dimensions))
            .collect();

        // 3. 写入前快照
        let before = self.snapshot(family, &ids).await?;

        // 4. 分块写入
        let upsert = self.engine.upsert(family, records).await?;

        // 5. 变更历史
        let history_entries = self.record_history(actor, family, &ids, &before).await;

        // 6. 发布
        let published = self.publish_keys(keys).await?;

        info!(
            rows = upsert.rows,
            chunks = upsert.chunk_count(),
            keys = published.len(),
            "Rules synchronized"
        );

        Ok(SyncReport {
            rows_written: upsert.rows,
            chunk_sizes: upsert.chunk_sizes,
            deactivated: 0,
            history_entries,
            published,
        })
    }

    /// 软删除规则并发布受影响的分组键
    ///
    /// 任一 ID 不存在时整体拒绝；已是停用状态的规则不产生历史也不触发发布。
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn deactivate_rules(
        &self,
        actor: &str,
        family: RuleFamily,
        ids: &[Uuid],
    ) -> Result<SyncReport> {
        let ids = unique_ids(ids.iter().copied());
        if ids.is_empty() {
            return Ok(SyncReport::default());
        }

        let existing = self.rules.fetch_by_ids(family, &ids).await?;
        let before: HashMap<Uuid, TargetingRule> =
            existing.into_iter().map(|r| (r.rule_id, r)).collect();

        if let Some(missing) = ids.iter().find(|id| !before.contains_key(*id)) {
            return Err(SyncError::RuleNotFound {
                family,
                rule_id: *missing,
            });
        }

        let targets: Vec<Uuid> = ids
            .iter()
            .copied()
            .filter(|id| before.get(id).is_some_and(|r| r.active))
            .collect();
        if targets.is_empty() {
            info!("All rules already inactive, nothing to publish");
            return Ok(SyncReport::default());
        }

        let deactivated = self.rules.deactivate(family, &targets).await? as usize;

        let history_entries = self
            .record_history(actor, family, &targets, &before)
            .await;

        let keys: BTreeSet<GroupingKey> = targets
            .iter()
            .filter_map(|id| before.get(id))
            .flat_map(|r| GroupingKey::for_rule(family, &r.dimensions))
            .collect();
        let published = self.publish_keys(keys).await?;

        info!(deactivated, keys = published.len(), "Rules deactivated");

        Ok(SyncReport {
            deactivated,
            history_entries,
            published,
            ..Default::default()
        })
    }

    /// 重新发布一个分组键
    pub async fn republish(&self, key: &GroupingKey) -> Result<MetadataArtifact> {
        self.publisher.publish(key).await
    }

    /// 读取分组键的当前制品
    pub async fn latest(&self, key: &GroupingKey) -> Result<Option<MetadataArtifact>> {
        self.publisher.store().latest(&key.as_key()).await
    }

    /// 调用方给出的 ID 必须已存在，且维度组合与已存储的一致
    async fn verify_supplied_ids(
        &self,
        family: RuleFamily,
        inputs: &[RuleInput],
        records: &[RuleRecord],
    ) -> Result<()> {
        let supplied: Vec<&RuleRecord> = inputs
            .iter()
            .zip(records)
            .filter(|(input, _)| input.rule_id.is_some())
            .map(|(_, record)| record)
            .collect();
        if supplied.is_empty() {
            return Ok(());
        }

        let ids = unique_ids(supplied.iter().map(|r| r.rule_id));
        let stored: HashMap<Uuid, TargetingRule> = self
            .rules
            .fetch_by_ids(family, &ids)
            .await?
            .into_iter()
            .map(|r| (r.rule_id, r))
            .collect();

        for record in supplied {
            match stored.get(&record.rule_id) {
                None => {
                    return Err(SyncError::RuleNotFound {
                        family,
                        rule_id: record.rule_id,
                    });
                }
                Some(existing) if existing.dimensions != record.dimensions => {
                    return Err(SyncError::Validation(format!(
                        "规则 {} 的维度组合不可修改: {} -> {}",
                        record.rule_id,
                        existing.dimensions.label(),
                        record.dimensions.label()
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    async fn snapshot(
        &self,
        family: RuleFamily,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, TargetingRule>> {
        if !self.recorder.is_enabled() {
            return Ok(HashMap::new());
        }

        let rows = self.rules.fetch_by_ids(family, ids).await?;
        Ok(rows.into_iter().map(|r| (r.rule_id, r)).collect())
    }

    async fn record_history(
        &self,
        actor: &str,
        family: RuleFamily,
        ids: &[Uuid],
        before: &HashMap<Uuid, TargetingRule>,
    ) -> usize {
        if !self.recorder.is_enabled() {
            return 0;
        }

        // 历史记录失败不影响已提交的写入
        let after = match self.rules.fetch_by_ids(family, ids).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to load rules for history, history skipped");
                return 0;
            }
        };
        if after.len() < ids.len() {
            // 自然键规则族：已有行的 ID 与派生 ID 不同（如外部导入的行）时按自然键更新了旧行
            warn!(
                expected = ids.len(),
                found = after.len(),
                "Some written rules not found by id, history skipped for them"
            );
        }

        let mut written = 0;
        for rule in &after {
            if self
                .recorder
                .record(actor, family, before.get(&rule.rule_id), rule)
                .await
            {
                written += 1;
            }
        }

        written
    }

    /// 并发发布所有分组键；全部尝试之后再报告失败
    async fn publish_keys(&self, keys: BTreeSet<GroupingKey>) -> Result<Vec<PublishedKey>> {
        let results = join_all(keys.iter().map(|key| self.publisher.publish(key))).await;

        let mut published = Vec::with_capacity(results.len());
        let mut failed_keys = Vec::new();
        let mut first_error = None;

        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(artifact) => published.push(PublishedKey::from(&artifact)),
                Err(e) => {
                    failed_keys.push(key.as_key());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            None => Ok(published),
            Some(source) => {
                warn!(
                    failed = failed_keys.len(),
                    published = published.len(),
                    "Some grouping keys failed to publish"
                );
                Err(SyncError::PublishFailed {
                    failed_keys,
                    published: published.len(),
                    source: Box::new(source),
                })
            }
        }
    }
}

/// 校验并编译输入，返回待写入记录
fn compile_inputs(family: RuleFamily, inputs: &[RuleInput]) -> Result<Vec<RuleRecord>> {
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            input
                .validate()
                .map_err(|e| SyncError::Validation(format!("第 {} 条规则: {}", index, e)))?;

            let compiled = compiler::compile(&input.dimensions(), input.rule_id);
            family
                .validate_dimensions(&compiled.dimensions)
                .and_then(|_| family.validate_value(input.value))
                .map_err(|e| SyncError::Validation(format!("第 {} 条规则: {}", index, e)))?;

            Ok(compiled.into_record(input.value))
        })
        .collect()
}

fn unique_ids(ids: impl Iterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DimensionTuple;
    use crate::repository::{MemoryStore, MockHistoryRepository, MockRuleRepository};

    fn config() -> RuleSyncConfig {
        RuleSyncConfig {
            chunk_size: 2,
            history_enabled: true,
        }
    }

    fn input(country: Option<&str>, value: f64) -> RuleInput {
        let mut dims = DimensionTuple::new("20814", "stream-together.org").with_device("mobile");
        dims.country = country.map(str::to_string);
        RuleInput::new(dims, value)
    }

    #[test]
    fn test_compile_inputs_rejects_family_violations() {
        let err = compile_inputs(RuleFamily::LoopingRatio, &[input(None, 1.5)]).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let mut with_os = input(Some("us"), 30.0);
        with_os.os = Some("ios".to_string());
        assert!(compile_inputs(RuleFamily::BidCaching, &[with_os]).is_err());

        let records = compile_inputs(RuleFamily::Floor, &[input(Some("IL"), 1.0)]).unwrap();
        assert_eq!(records[0].dimensions.country.as_deref(), Some("il"));
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let mut rules = MockRuleRepository::new();
        rules.expect_fetch_by_ids().never();
        rules.expect_upsert_chunk().never();
        let mut history = MockHistoryRepository::new();
        history.expect_insert().never();

        let service = RuleSyncService::new(
            Arc::new(rules),
            Arc::new(MemoryStore::new()),
            Arc::new(history),
            &config(),
        )
        .unwrap();

        let result = service
            .upsert_rules(
                "ops",
                RuleFamily::PriceFactor,
                vec![input(None, 1.0), input(Some("usa"), 1.0)],
            )
            .await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_deactivate_unknown_id_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let service =
            RuleSyncService::new(store.clone(), store.clone(), store.clone(), &config()).unwrap();

        let unknown = Uuid::new_v4();
        let err = service
            .deactivate_rules("ops", RuleFamily::Floor, &[unknown])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RuleNotFound { rule_id, .. } if rule_id == unknown));
        assert_eq!(store.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_reports_failed_keys() {
        let store = Arc::new(MemoryStore::new());
        store.fail_publishes_for("floor:20814:stream-together.org:1");
        let service =
            RuleSyncService::new(store.clone(), store.clone(), store.clone(), &config()).unwrap();

        // 设备通配，涉及移动端与非移动端两个分组键
        let mut any_device = input(Some("us"), 2.0);
        any_device.device = None;

        let err = service
            .upsert_rules("ops", RuleFamily::Floor, vec![any_device])
            .await
            .unwrap_err();

        match err {
            SyncError::PublishFailed {
                failed_keys,
                published,
                ..
            } => {
                assert_eq!(failed_keys, vec!["floor:20814:stream-together.org:1".to_string()]);
                assert_eq!(published, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 规则已落库，另一个分组键已发布
        assert_eq!(store.rules(RuleFamily::Floor).len(), 1);
        assert_eq!(store.artifacts("floor:20814:stream-together.org:0").len(), 1);
    }

    #[tokio::test]
    async fn test_republish_appends_new_artifact_with_same_rules() {
        let store = Arc::new(MemoryStore::new());
        let service =
            RuleSyncService::new(store.clone(), store.clone(), store.clone(), &config()).unwrap();
        let key = GroupingKey::new(RuleFamily::Floor, "20814", "stream-together.org", true);

        // 从未写入的分组键也可发布，得到空规则集
        let empty = service.republish(&key).await.unwrap();
        assert_eq!(empty.rule_count(), 0);

        service
            .upsert_rules("ops", RuleFamily::Floor, vec![input(Some("us"), 1.0)])
            .await
            .unwrap();
        let before = service.latest(&key).await.unwrap().unwrap();

        let republished = service.republish(&key).await.unwrap();
        assert_ne!(republished.transaction_id, before.transaction_id);
        assert_eq!(republished.value, before.value);
        assert_eq!(store.artifacts(&key.as_key()).len(), 3);
    }
}
