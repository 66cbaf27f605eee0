//! 元数据发布
//!
//! 针对一个分组键：重新读取全部生效规则 -> 按特异度排序 -> 序列化 -> 追加新制品。
//! 整个过程在持有该键锁的发布会话内完成，同一键的并发发布串行执行。

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::{error, info, instrument};

use adx_shared::observability::metrics;

use crate::compiler;
use crate::error::Result;
use crate::family::RuleFamily;
use crate::models::{GroupingKey, MetadataArtifact, NewArtifact, TargetingRule};
use crate::ranker;
use crate::repository::ArtifactStore;

/// 序列化已排序的规则集
///
/// 输出形如 `{"rules": [{"rule": "(p=..)", "<value_field>": v, "rule_id": "..."}]}`。
pub fn render_rule_set(family: RuleFamily, rules: &[TargetingRule]) -> Value {
    let entries: Vec<Value> = rules
        .iter()
        .map(|rule| {
            let mut entry = Map::new();
            entry.insert(
                "rule".to_string(),
                Value::String(compiler::pattern(&rule.dimensions)),
            );
            entry.insert(family.value_field().to_string(), family.value_json(rule.value));
            entry.insert("rule_id".to_string(), Value::String(rule.rule_id.to_string()));
            Value::Object(entry)
        })
        .collect();

    json!({ "rules": entries })
}

/// 元数据发布器
pub struct MetadataPublisher<A: ArtifactStore> {
    store: Arc<A>,
}

impl<A: ArtifactStore> MetadataPublisher<A> {
    pub fn new(store: Arc<A>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<A> {
        &self.store
    }

    /// 重新计算并发布分组键的完整规则集
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn publish(&self, key: &GroupingKey) -> Result<MetadataArtifact> {
        let started = Instant::now();
        let family = key.family;

        let result = self.publish_locked(key).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(artifact) => {
                let rules = artifact.rule_count();
                metrics::record_publish(family.as_str(), "success", rules, elapsed);
                info!(
                    transaction_id = %artifact.transaction_id,
                    rules,
                    "Metadata published"
                );
            }
            Err(e) => {
                metrics::record_publish(family.as_str(), "failed", 0, elapsed);
                error!(error = %e, "Metadata publish failed");
            }
        }

        result
    }

    async fn publish_locked(&self, key: &GroupingKey) -> Result<MetadataArtifact> {
        let mut session = self.store.begin_publish(key).await?;

        let mut rules = session.load_active_rules().await?;
        ranker::rank(&mut rules);

        let value = render_rule_set(key.family, &rules);
        session.append(NewArtifact::new(key.as_key(), value)).await
    }
}
