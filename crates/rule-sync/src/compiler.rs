//! 规则公式编译器
//!
//! 将定向维度元组规范化为公式字符串，并由公式确定性地派生规则 ID。
//! 同一元组（缺省维度视为通配）无论提交多少次都得到同一个 ID。

use uuid::Uuid;

use crate::models::{DimensionTuple, RuleRecord};

/// 参与哈希的规范公式中的通配符
pub const WILDCARD: &str = "*";

/// 发布公式（正则）中的通配符
pub const WILDCARD_PATTERN: &str = ".*";

/// 规则 ID 派生使用的命名空间
pub const RULE_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

/// 编译结果
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    /// 规范化后的维度
    pub dimensions: DimensionTuple,
    /// 参与哈希的规范公式
    pub formula: String,
    /// 发布给竞价引擎的正则公式
    pub pattern: String,
    pub rule_id: Uuid,
}

impl CompiledRule {
    pub fn into_record(self, value: f64) -> RuleRecord {
        RuleRecord {
            rule_id: self.rule_id,
            dimensions: self.dimensions,
            value,
        }
    }
}

/// 规范化单个维度值：去除所有空白并转小写，空值与通配符统一为 `None`
pub fn normalize_dimension(value: Option<&str>) -> Option<String> {
    let normalized: String = value?
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();

    match normalized.as_str() {
        "" | WILDCARD | WILDCARD_PATTERN => None,
        _ => Some(normalized),
    }
}

fn normalize_required(value: &str) -> String {
    normalize_dimension(Some(value)).unwrap_or_default()
}

/// 规范化整个维度元组
pub fn normalize(dimensions: &DimensionTuple) -> DimensionTuple {
    DimensionTuple {
        publisher: normalize_required(&dimensions.publisher),
        domain: normalize_required(&dimensions.domain),
        country: normalize_dimension(dimensions.country.as_deref()),
        os: normalize_dimension(dimensions.os.as_deref()),
        device: normalize_dimension(dimensions.device.as_deref()),
        placement_type: normalize_dimension(dimensions.placement_type.as_deref()),
        browser: normalize_dimension(dimensions.browser.as_deref()),
    }
}

fn render(dimensions: &DimensionTuple, wildcard: &str) -> String {
    let [country, os, device, placement, browser] =
        dimensions.refinements().map(|v| v.unwrap_or(wildcard));
    format!(
        "p={}__d={}__c={}__os={}__dt={}__pt={}__b={}",
        dimensions.publisher, dimensions.domain, country, os, device, placement, browser
    )
}

/// 规范公式，输入须已规范化
pub fn canonical_formula(dimensions: &DimensionTuple) -> String {
    render(dimensions, WILDCARD)
}

/// 发布用正则公式，形如 `(p=..__b=.*)`，输入须已规范化
pub fn pattern(dimensions: &DimensionTuple) -> String {
    format!("({})", render(dimensions, WILDCARD_PATTERN))
}

/// 由规范公式派生规则 ID（UUID v5）
pub fn derive_rule_id(formula: &str) -> Uuid {
    Uuid::new_v5(&RULE_NAMESPACE, formula.as_bytes())
}

/// 编译维度元组
///
/// 调用方提供已有 ID 时原样使用，否则由规范公式派生。
pub fn compile(dimensions: &DimensionTuple, existing: Option<Uuid>) -> CompiledRule {
    let dimensions = normalize(dimensions);
    let formula = canonical_formula(&dimensions);
    let pattern = pattern(&dimensions);
    let rule_id = existing.unwrap_or_else(|| derive_rule_id(&formula));

    CompiledRule {
        dimensions,
        formula,
        pattern,
        rule_id,
    }
}
