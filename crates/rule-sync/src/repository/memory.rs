//! 内存存储
//!
//! 同时实现规则、分发与历史三个仓储接口，语义与 PostgreSQL 实现保持一致：
//! 每个分块原子写入、按首次插入顺序读取、同一分组键的发布串行执行。
//! 支持注入分块写入失败与发布失败，用于测试中止与部分失败路径。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::traits::{ArtifactStore, HistoryRepository, PublishSession, RuleRepository};
use crate::error::{Result, SyncError};
use crate::family::RuleFamily;
use crate::history::HistoryEntry;
use crate::models::{GroupingKey, MetadataArtifact, NewArtifact, RuleRecord, TargetingRule};

#[derive(Default)]
struct Inner {
    rules: RwLock<HashMap<RuleFamily, Vec<TargetingRule>>>,
    artifacts: RwLock<Vec<MetadataArtifact>>,
    history: RwLock<Vec<HistoryEntry>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,

    chunk_calls: AtomicUsize,
    committed_chunks: Mutex<Vec<usize>>,
    fail_on_chunk: Mutex<Option<usize>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_history: AtomicBool,
}

impl Inner {
    /// 单调递增的时间戳，同一毫秒内的写入也能区分先后
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock();
        let now = Utc::now();
        let ts = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(ts);
        ts
    }
}

/// 内存存储，克隆后共享同一份数据
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第 `index` 次（从 0 开始）分块写入失败并回滚
    pub fn fail_on_chunk(&self, index: usize) {
        *self.inner.fail_on_chunk.lock() = Some(index);
    }

    /// 该 key 的发布在追加制品时失败
    pub fn fail_publishes_for(&self, key: impl Into<String>) {
        self.inner.failing_keys.lock().insert(key.into());
    }

    /// 历史写入失败
    pub fn fail_history(&self, fail: bool) {
        self.inner.fail_history.store(fail, Ordering::SeqCst);
    }

    /// 已提交分块的行数，按提交顺序
    pub fn committed_chunks(&self) -> Vec<usize> {
        self.inner.committed_chunks.lock().clone()
    }

    /// 某规则族的全部行（含已软删除），按首次插入顺序
    pub fn rules(&self, family: RuleFamily) -> Vec<TargetingRule> {
        self.inner
            .rules
            .read()
            .get(&family)
            .cloned()
            .unwrap_or_default()
    }

    /// 某 key 的全部制品，按追加顺序
    pub fn artifacts(&self, key: &str) -> Vec<MetadataArtifact> {
        self.inner
            .artifacts
            .read()
            .iter()
            .filter(|a| a.key == key)
            .cloned()
            .collect()
    }

    pub fn artifact_count(&self) -> usize {
        self.inner.artifacts.read().len()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.read().clone()
    }
}

fn same_row(family: RuleFamily, existing: &TargetingRule, record: &RuleRecord) -> bool {
    let candidate = RuleRecord {
        rule_id: existing.rule_id,
        dimensions: existing.dimensions.clone(),
        value: existing.value,
    };
    family.conflict_key(&candidate) == family.conflict_key(record)
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn upsert_chunk(&self, family: RuleFamily, records: &[RuleRecord]) -> Result<u64> {
        let call = self.inner.chunk_calls.fetch_add(1, Ordering::SeqCst);
        if *self.inner.fail_on_chunk.lock() == Some(call) {
            return Err(SyncError::Internal(format!("模拟分块写入失败: chunk {}", call)));
        }

        let now = self.inner.next_timestamp();
        let mut tables = self.inner.rules.write();
        let table = tables.entry(family).or_default();

        // 在副本上写入，整块成功后替换，失败时不留下部分结果
        let mut rows = table.clone();
        for record in records {
            match rows.iter().position(|row| same_row(family, row, record)) {
                Some(index) => {
                    let row = &mut rows[index];
                    row.value = record.value;
                    row.active = true;
                    row.updated_at = now;
                }
                None if rows.iter().any(|row| row.rule_id == record.rule_id) => {
                    return Err(SyncError::Internal(format!(
                        "主键冲突: rule_id {} 已被其他维度组合占用",
                        record.rule_id
                    )));
                }
                None => rows.push(TargetingRule {
                    rule_id: record.rule_id,
                    dimensions: record.dimensions.clone(),
                    value: record.value,
                    active: true,
                    created_at: now,
                    updated_at: now,
                }),
            }
        }
        *table = rows;

        self.inner.committed_chunks.lock().push(records.len());
        Ok(records.len() as u64)
    }

    async fn fetch_by_ids(&self, family: RuleFamily, ids: &[Uuid]) -> Result<Vec<TargetingRule>> {
        let tables = self.inner.rules.read();
        Ok(tables
            .get(&family)
            .map(|rows| {
                rows.iter()
                    .filter(|row| ids.contains(&row.rule_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn deactivate(&self, family: RuleFamily, ids: &[Uuid]) -> Result<u64> {
        let now = self.inner.next_timestamp();
        let mut tables = self.inner.rules.write();
        let mut changed = 0;

        if let Some(rows) = tables.get_mut(&family) {
            for row in rows.iter_mut().filter(|r| r.active && ids.contains(&r.rule_id)) {
                row.active = false;
                row.updated_at = now;
                changed += 1;
            }
        }

        Ok(changed)
    }
}

#[async_trait]
impl HistoryRepository for MemoryStore {
    async fn insert(&self, entry: &HistoryEntry) -> Result<()> {
        if self.inner.fail_history.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("模拟历史写入失败".to_string()));
        }
        self.inner.history.write().push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn begin_publish(&self, key: &GroupingKey) -> Result<Box<dyn PublishSession>> {
        let lock = self
            .inner
            .key_locks
            .entry(key.as_key())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        Ok(Box::new(MemoryPublishSession {
            store: self.clone(),
            key: key.clone(),
            guard: Some(guard),
        }))
    }

    async fn latest(&self, key: &str) -> Result<Option<MetadataArtifact>> {
        Ok(self
            .inner
            .artifacts
            .read()
            .iter()
            .filter(|a| a.key == key)
            .max_by_key(|a| (a.created_at, a.transaction_id))
            .cloned())
    }

    async fn compact(&self, keep_latest: usize) -> Result<u64> {
        if keep_latest == 0 {
            return Err(SyncError::Validation("keep_latest 必须大于0".to_string()));
        }

        let mut artifacts = self.inner.artifacts.write();

        let mut per_key: HashMap<&str, Vec<(DateTime<Utc>, Uuid)>> = HashMap::new();
        for a in artifacts.iter() {
            per_key
                .entry(a.key.as_str())
                .or_default()
                .push((a.created_at, a.transaction_id));
        }
        let doomed: HashSet<Uuid> = per_key
            .into_values()
            .flat_map(|mut versions| {
                versions.sort_by(|a, b| b.cmp(a));
                versions.into_iter().skip(keep_latest).map(|(_, id)| id)
            })
            .collect();

        let before = artifacts.len();
        artifacts.retain(|a| !doomed.contains(&a.transaction_id));
        Ok((before - artifacts.len()) as u64)
    }
}

/// 持有分组键互斥锁的发布会话
pub struct MemoryPublishSession {
    store: MemoryStore,
    key: GroupingKey,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl PublishSession for MemoryPublishSession {
    async fn load_active_rules(&mut self) -> Result<Vec<TargetingRule>> {
        if self.guard.is_none() {
            return Err(SyncError::Internal(format!("发布会话已结束: {}", self.key)));
        }

        let tables = self.store.inner.rules.read();
        Ok(tables
            .get(&self.key.family)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.active && self.key.matches(&r.dimensions))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append(&mut self, artifact: NewArtifact) -> Result<MetadataArtifact> {
        let _guard = self
            .guard
            .take()
            .ok_or_else(|| SyncError::Internal(format!("发布会话已结束: {}", self.key)))?;

        if self.store.inner.failing_keys.lock().contains(&artifact.key) {
            return Err(SyncError::Internal(format!("模拟发布失败: {}", artifact.key)));
        }

        let stored = MetadataArtifact {
            transaction_id: artifact.transaction_id,
            key: artifact.key,
            value: artifact.value,
            version: None,
            created_at: self.store.inner.next_timestamp(),
        };
        self.store.inner.artifacts.write().push(stored.clone());

        Ok(stored)
    }
}
