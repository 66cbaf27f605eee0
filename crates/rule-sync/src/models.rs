//! 规则与元数据实体定义

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::family::RuleFamily;

/// 设备取值为 mobile 时归入移动端分组
pub const MOBILE_DEVICE: &str = "mobile";

/// 定向维度元组
///
/// `None` 表示通配。publisher 与 domain 为必填分组维度。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimensionTuple {
    pub publisher: String,
    pub domain: String,
    #[sqlx(default)]
    pub country: Option<String>,
    #[sqlx(default)]
    pub os: Option<String>,
    #[sqlx(rename = "device_type", default)]
    pub device: Option<String>,
    #[sqlx(default)]
    pub placement_type: Option<String>,
    #[sqlx(default)]
    pub browser: Option<String>,
}

impl DimensionTuple {
    pub fn new(publisher: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_placement_type(mut self, placement_type: impl Into<String>) -> Self {
        self.placement_type = Some(placement_type.into());
        self
    }

    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    /// 细分维度（country, os, device, placement, browser）
    pub fn refinements(&self) -> [Option<&str>; 5] {
        [
            self.country.as_deref(),
            self.os.as_deref(),
            self.device.as_deref(),
            self.placement_type.as_deref(),
            self.browser.as_deref(),
        ]
    }

    /// 设备是否为通配
    pub fn is_any_device(&self) -> bool {
        self.device.is_none()
    }

    /// 历史记录中展示用的条目标签，通配以 `*` 表示
    pub fn label(&self) -> String {
        let mut parts = vec![self.publisher.as_str(), self.domain.as_str()];
        parts.extend(self.refinements().into_iter().map(|v| v.unwrap_or("*")));
        parts.join(" / ")
    }
}

/// 已持久化的定向规则
///
/// 五个规则族共用同一结构，`value` 对应各族自己的数值列。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TargetingRule {
    pub rule_id: Uuid,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub dimensions: DimensionTuple,
    pub value: f64,
    /// false 表示软删除
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待写入的规则行（已编译、已校验）
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub rule_id: Uuid,
    pub dimensions: DimensionTuple,
    pub value: f64,
}

/// 元数据分组键
///
/// 同一规则族、publisher、domain 与移动端标记下的规则共同发布为一个制品。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupingKey {
    pub family: RuleFamily,
    pub publisher: String,
    pub domain: String,
    pub mobile: bool,
}

impl GroupingKey {
    pub fn new(
        family: RuleFamily,
        publisher: impl Into<String>,
        domain: impl Into<String>,
        mobile: bool,
    ) -> Self {
        Self {
            family,
            publisher: publisher.into(),
            domain: domain.into(),
            mobile,
        }
    }

    /// 规则所属的分组键
    ///
    /// 设备通配的规则同时属于移动端与非移动端两个分组。
    pub fn for_rule(family: RuleFamily, dimensions: &DimensionTuple) -> Vec<GroupingKey> {
        let key = |mobile| {
            GroupingKey::new(
                family,
                dimensions.publisher.clone(),
                dimensions.domain.clone(),
                mobile,
            )
        };

        match dimensions.device.as_deref() {
            None => vec![key(false), key(true)],
            Some(device) => vec![key(device == MOBILE_DEVICE)],
        }
    }

    /// 分发表中使用的 key 字符串
    pub fn as_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.family.key_prefix(),
            self.publisher,
            self.domain,
            u8::from(self.mobile)
        )
    }

    /// 规则是否属于该分组
    pub fn matches(&self, dimensions: &DimensionTuple) -> bool {
        dimensions.publisher == self.publisher
            && dimensions.domain == self.domain
            && match dimensions.device.as_deref() {
                None => true,
                Some(device) => (device == MOBILE_DEVICE) == self.mobile,
            }
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// 已发布的元数据制品（只追加，不修改）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetadataArtifact {
    pub transaction_id: Uuid,
    pub key: String,
    pub value: Value,
    /// 暂未使用
    #[sqlx(default)]
    pub version: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl MetadataArtifact {
    /// 制品中包含的规则数
    pub fn rule_count(&self) -> usize {
        self.value
            .get("rules")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

/// 待追加的制品
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub transaction_id: Uuid,
    pub key: String,
    pub value: Value,
}

impl NewArtifact {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            key: key.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_key_string() {
        let key = GroupingKey::new(RuleFamily::PriceFactor, "20814", "stream-together.org", true);
        assert_eq!(key.as_key(), "price-factor:20814:stream-together.org:1");

        let key = GroupingKey::new(RuleFamily::LoopingRatio, "1", "a.com", false);
        assert_eq!(key.to_string(), "looping-ratio:1:a.com:0");
    }

    #[test]
    fn test_wildcard_device_belongs_to_both_keys() {
        let dims = DimensionTuple::new("1", "a.com").with_country("us");
        let keys = GroupingKey::for_rule(RuleFamily::Floor, &dims);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.matches(&dims)));

        let desktop = DimensionTuple::new("1", "a.com").with_device("desktop");
        let keys = GroupingKey::for_rule(RuleFamily::Floor, &desktop);
        assert_eq!(keys, vec![GroupingKey::new(RuleFamily::Floor, "1", "a.com", false)]);
        assert!(!GroupingKey::new(RuleFamily::Floor, "1", "a.com", true).matches(&desktop));
    }

    #[test]
    fn test_dimension_label() {
        let dims = DimensionTuple::new("20814", "stream-together.org")
            .with_country("il")
            .with_device("mobile");
        assert_eq!(dims.label(), "20814 / stream-together.org / il / * / mobile / * / *");
    }

    #[test]
    fn test_artifact_rule_count() {
        let artifact = MetadataArtifact {
            transaction_id: Uuid::new_v4(),
            key: "floor:1:a.com:0".to_string(),
            value: serde_json::json!({"rules": [{"rule": "x"}, {"rule": "y"}]}),
            version: None,
            created_at: Utc::now(),
        };
        assert_eq!(artifact.rule_count(), 2);
    }
}
