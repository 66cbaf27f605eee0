//! 变更历史记录
//!
//! 将写入前后的快照展开为 `属性路径 -> 值` 映射并逐项比较。
//! 差异为空时不写入任何记录；写入失败只记录日志，不影响规则写入本身。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use adx_shared::observability::metrics;

use crate::error::Result;
use crate::family::RuleFamily;
use crate::models::TargetingRule;
use crate::repository::HistoryRepository;

/// 不参与比较的簿记字段
const IGNORED_FIELDS: [&str; 2] = ["created_at", "updated_at"];

/// 变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    Created,
    Updated,
    Deleted,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个字段的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub property: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// 一条变更历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub actor: String,
    pub action: HistoryAction,
    /// 主题分类，如 "Price Factor"
    pub subject: String,
    /// 由维度元组生成的条目标签
    pub item: String,
    pub rule_id: Option<Uuid>,
    /// 按属性名排序
    pub changes: Vec<FieldChange>,
}

/// 展开 JSON 快照为点分路径映射
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, path: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if path.is_empty() && IGNORED_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten_into(child, child_path, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(child, format!("{path}.{i}"), out);
            }
        }
        leaf => {
            out.insert(path, leaf.clone());
        }
    }
}

/// 比较两个快照，返回按属性名排序的差异
pub fn diff(before: Option<&Value>, after: &Value) -> Vec<FieldChange> {
    let old = before.map(flatten).unwrap_or_default();
    let new = flatten(after);

    let mut properties: Vec<&String> = old.keys().chain(new.keys()).collect();
    properties.sort();
    properties.dedup();

    properties
        .into_iter()
        .filter_map(|property| {
            let (o, n) = (old.get(property), new.get(property));
            (o != n).then(|| FieldChange {
                property: property.clone(),
                old: o.cloned(),
                new: n.cloned(),
            })
        })
        .collect()
}

fn classify(before: Option<&TargetingRule>, after: &TargetingRule) -> HistoryAction {
    match before {
        None => HistoryAction::Created,
        Some(prev) if prev.active && !after.active => HistoryAction::Deleted,
        Some(_) => HistoryAction::Updated,
    }
}

/// 构造历史条目，差异为空时返回 `None`
pub fn build_entry(
    actor: &str,
    family: RuleFamily,
    before: Option<&TargetingRule>,
    after: &TargetingRule,
) -> Result<Option<HistoryEntry>> {
    let old = before.map(serde_json::to_value).transpose()?;
    let new = serde_json::to_value(after)?;

    let changes = diff(old.as_ref(), &new);
    if changes.is_empty() {
        return Ok(None);
    }

    Ok(Some(HistoryEntry {
        actor: actor.to_string(),
        action: classify(before, after),
        subject: family.subject_label().to_string(),
        item: after.dimensions.label(),
        rule_id: Some(after.rule_id),
        changes,
    }))
}

/// 变更历史记录器
pub struct ChangeHistoryRecorder<H: HistoryRepository> {
    repo: Arc<H>,
    enabled: bool,
}

impl<H: HistoryRepository> ChangeHistoryRecorder<H> {
    pub fn new(repo: Arc<H>, enabled: bool) -> Self {
        Self { repo, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 记录一次状态变化，返回是否写入了历史
    pub async fn record(
        &self,
        actor: &str,
        family: RuleFamily,
        before: Option<&TargetingRule>,
        after: &TargetingRule,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let entry = match build_entry(actor, family, before, after) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(rule_id = %after.rule_id, "No changes, history skipped");
                return false;
            }
            Err(e) => {
                error!(rule_id = %after.rule_id, error = %e, "Failed to build history entry");
                return false;
            }
        };

        match self.repo.insert(&entry).await {
            Ok(()) => {
                metrics::record_history_entry(&entry.subject, entry.action.as_str());
                true
            }
            Err(e) => {
                error!(
                    rule_id = %after.rule_id,
                    action = %entry.action,
                    error = %e,
                    "Failed to persist history entry"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::models::DimensionTuple;
    use crate::repository::MockHistoryRepository;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn rule(value: f64, active: bool) -> TargetingRule {
        TargetingRule {
            rule_id: Uuid::nil(),
            dimensions: DimensionTuple::new("1", "a.com").with_country("us"),
            value,
            active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_flatten_nested_paths() {
        let flat = flatten(&json!({"a": {"b": 1, "c": [true, null]}, "updated_at": "x"}));
        assert_eq!(flat.get("a.b"), Some(&json!(1)));
        assert_eq!(flat.get("a.c.0"), Some(&json!(true)));
        assert_eq!(flat.get("a.c.1"), Some(&Value::Null));
        assert!(!flat.contains_key("updated_at"));
    }

    #[test]
    fn test_diff_is_ordered_by_property() {
        let changes = diff(
            Some(&json!({"value": 1.0, "active": true})),
            &json!({"value": 2.0, "active": false}),
        );
        let properties: Vec<&str> = changes.iter().map(|c| c.property.as_str()).collect();
        assert_eq!(properties, vec!["active", "value"]);
        assert_eq!(changes[1].old, Some(json!(1.0)));
        assert_eq!(changes[1].new, Some(json!(2.0)));
    }

    #[test]
    fn test_entry_actions() {
        let created = build_entry("ops", RuleFamily::Floor, None, &rule(1.0, true))
            .unwrap()
            .unwrap();
        assert_eq!(created.action, HistoryAction::Created);
        assert_eq!(created.subject, "Floor");
        assert_eq!(created.item, "1 / a.com / us / * / * / * / *");

        let updated = build_entry(
            "ops",
            RuleFamily::Floor,
            Some(&rule(1.0, true)),
            &rule(2.0, true),
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.action, HistoryAction::Updated);
        assert_eq!(updated.changes.len(), 1);

        let deleted = build_entry(
            "ops",
            RuleFamily::Floor,
            Some(&rule(1.0, true)),
            &rule(1.0, false),
        )
        .unwrap()
        .unwrap();
        assert_eq!(deleted.action, HistoryAction::Deleted);
    }

    #[test]
    fn test_timestamps_alone_produce_no_entry() {
        let before = rule(1.0, true);
        let mut after = before.clone();
        after.updated_at = before.updated_at + Duration::seconds(30);

        assert!(
            build_entry("ops", RuleFamily::Dpo, Some(&before), &after)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_recorder_persists_non_empty_diff() {
        let mut repo = MockHistoryRepository::new();
        repo.expect_insert()
            .withf(|entry| entry.action == HistoryAction::Updated && entry.actor == "ops")
            .times(1)
            .returning(|_| Ok(()));

        let recorder = ChangeHistoryRecorder::new(Arc::new(repo), true);
        assert!(
            recorder
                .record("ops", RuleFamily::Floor, Some(&rule(1.0, true)), &rule(3.0, true))
                .await
        );
    }

    #[tokio::test]
    async fn test_recorder_swallows_storage_failure() {
        let mut repo = MockHistoryRepository::new();
        repo.expect_insert()
            .times(1)
            .returning(|_| Err(SyncError::Internal("history table unavailable".to_string())));

        let recorder = ChangeHistoryRecorder::new(Arc::new(repo), true);
        assert!(!recorder.record("ops", RuleFamily::Floor, None, &rule(1.0, true)).await);
    }

    #[tokio::test]
    async fn test_disabled_recorder_writes_nothing() {
        let mut repo = MockHistoryRepository::new();
        repo.expect_insert().never();

        let recorder = ChangeHistoryRecorder::new(Arc::new(repo), false);
        assert!(!recorder.record("ops", RuleFamily::Floor, None, &rule(1.0, true)).await);
    }
}
