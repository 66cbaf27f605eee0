//! 规则族定义
//!
//! 五个规则族共用同一行结构，只在数值列名、取值约束、冲突键与允许的细分维度上不同。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::models::{DimensionTuple, RuleRecord};

/// 规则族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFamily {
    /// 价格系数
    PriceFactor,
    /// 底价
    Floor,
    /// 竞价缓存时长（秒）
    BidCaching,
    /// 循环比例
    LoopingRatio,
    /// 需求方优化调整
    Dpo,
}

/// 分块写入时 ON CONFLICT 使用的冲突键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictTarget {
    /// 以规则 ID 去重
    RuleId,
    /// 以 (publisher, domain, device_type, country) 自然键去重
    NaturalKey,
}

impl ConflictTarget {
    /// ON CONFLICT 子句中的列
    pub fn columns(&self) -> &'static str {
        match self {
            Self::RuleId => "rule_id",
            Self::NaturalKey => "publisher, domain, device_type, country",
        }
    }
}

/// 细分维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refinement {
    Country,
    Os,
    Device,
    PlacementType,
    Browser,
}

impl Refinement {
    pub const ALL: [Refinement; 5] = [
        Refinement::Country,
        Refinement::Os,
        Refinement::Device,
        Refinement::PlacementType,
        Refinement::Browser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Os => "os",
            Self::Device => "device",
            Self::PlacementType => "placement_type",
            Self::Browser => "browser",
        }
    }

    /// 取出元组中对应维度的值
    pub fn value_of<'a>(&self, dimensions: &'a DimensionTuple) -> Option<&'a str> {
        match self {
            Self::Country => dimensions.country.as_deref(),
            Self::Os => dimensions.os.as_deref(),
            Self::Device => dimensions.device.as_deref(),
            Self::PlacementType => dimensions.placement_type.as_deref(),
            Self::Browser => dimensions.browser.as_deref(),
        }
    }
}

impl RuleFamily {
    pub const ALL: [RuleFamily; 5] = [
        RuleFamily::PriceFactor,
        RuleFamily::Floor,
        RuleFamily::BidCaching,
        RuleFamily::LoopingRatio,
        RuleFamily::Dpo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceFactor => "price_factor",
            Self::Floor => "floor",
            Self::BidCaching => "bid_caching",
            Self::LoopingRatio => "looping_ratio",
            Self::Dpo => "dpo",
        }
    }

    /// 分组键前缀
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::PriceFactor => "price-factor",
            Self::Floor => "floor",
            Self::BidCaching => "bid-caching",
            Self::LoopingRatio => "looping-ratio",
            Self::Dpo => "dpo",
        }
    }

    /// 规则表名
    pub fn table(&self) -> &'static str {
        match self {
            Self::PriceFactor => "price_factor",
            Self::Floor => "floor",
            Self::BidCaching => "bid_caching",
            Self::LoopingRatio => "looping_ratio",
            Self::Dpo => "dpo_rule",
        }
    }

    /// 数值列名，同时也是发布 JSON 中的字段名
    pub fn value_field(&self) -> &'static str {
        match self {
            Self::PriceFactor | Self::Dpo => "factor",
            Self::Floor => "floor",
            Self::BidCaching => "bid_caching",
            Self::LoopingRatio => "ratio",
        }
    }

    /// 历史记录中的主题标签
    pub fn subject_label(&self) -> &'static str {
        match self {
            Self::PriceFactor => "Price Factor",
            Self::Floor => "Floor",
            Self::BidCaching => "Bid Caching",
            Self::LoopingRatio => "Looping Ratio",
            Self::Dpo => "DPO Rule",
        }
    }

    pub fn conflict_target(&self) -> ConflictTarget {
        match self {
            Self::BidCaching | Self::LoopingRatio => ConflictTarget::NaturalKey,
            Self::PriceFactor | Self::Floor | Self::Dpo => ConflictTarget::RuleId,
        }
    }

    /// 该规则族允许设置的细分维度
    pub fn refinements(&self) -> &'static [Refinement] {
        match self {
            Self::BidCaching | Self::LoopingRatio => &[Refinement::Country, Refinement::Device],
            Self::PriceFactor | Self::Floor | Self::Dpo => &Refinement::ALL,
        }
    }

    /// 校验数值取值范围
    pub fn validate_value(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(SyncError::Validation(format!(
                "{} 取值必须为有限数值",
                self.value_field()
            )));
        }

        let valid = match self {
            Self::PriceFactor => value > 0.0,
            Self::Floor => (0.0..=1000.0).contains(&value),
            Self::BidCaching => (0.0..=3600.0).contains(&value) && value.fract() == 0.0,
            Self::LoopingRatio => (0.0..=1.0).contains(&value),
            Self::Dpo => (-1.0..=1.0).contains(&value),
        };

        if valid {
            Ok(())
        } else {
            Err(SyncError::Validation(format!(
                "{} 取值超出范围: {} ({})",
                self.value_field(),
                value,
                self.value_range()
            )))
        }
    }

    fn value_range(&self) -> &'static str {
        match self {
            Self::PriceFactor => "v > 0",
            Self::Floor => "0 <= v <= 1000",
            Self::BidCaching => "整数秒, 0 <= v <= 3600",
            Self::LoopingRatio => "0 <= v <= 1",
            Self::Dpo => "-1 <= v <= 1",
        }
    }

    /// 校验维度组合：不允许的细分维度必须为通配
    pub fn validate_dimensions(&self, dimensions: &DimensionTuple) -> Result<()> {
        for refinement in Refinement::ALL {
            if refinement.value_of(dimensions).is_some() && !self.refinements().contains(&refinement)
            {
                return Err(SyncError::Validation(format!(
                    "{} 规则不支持维度 {}",
                    self,
                    refinement.as_str()
                )));
            }
        }
        Ok(())
    }

    /// 发布 JSON 中的数值表示（缓存时长为整数秒）
    pub fn value_json(&self, value: f64) -> Value {
        match self {
            Self::BidCaching => Value::from(value as i64),
            _ => Value::from(value),
        }
    }

    /// 批内去重使用的冲突键
    pub fn conflict_key(&self, record: &RuleRecord) -> String {
        match self.conflict_target() {
            ConflictTarget::RuleId => record.rule_id.to_string(),
            ConflictTarget::NaturalKey => {
                let d = &record.dimensions;
                format!(
                    "{}\u{1f}{}\u{1f}{}\u{1f}{}",
                    d.publisher,
                    d.domain,
                    d.device.as_deref().unwrap_or_default(),
                    d.country.as_deref().unwrap_or_default()
                )
            }
        }
    }
}

impl fmt::Display for RuleFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleFamily {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == normalized || (normalized == "dpo_rule" && *f == Self::Dpo))
            .ok_or_else(|| SyncError::Validation(format!("未知的规则族: {}", s)))
    }
}
