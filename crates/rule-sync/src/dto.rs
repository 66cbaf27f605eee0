//! 规则写入请求 DTO

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::compiler;
use crate::models::DimensionTuple;

/// 支持的设备取值
pub const DEVICE_TYPES: [&str; 5] = ["mobile", "desktop", "tablet", "ctv", "other"];

/// 单条规则写入请求
///
/// 细分维度缺省、为空或为 `*` 时视为通配。
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    /// 已有规则 ID，缺省时由维度派生
    #[serde(default, alias = "rule_id")]
    pub rule_id: Option<Uuid>,

    #[validate(
        length(max = 255, message = "publisher 不能超过255个字符"),
        custom(function = "validate_required")
    )]
    pub publisher: String,

    #[validate(
        length(max = 255, message = "domain 不能超过255个字符"),
        custom(function = "validate_required")
    )]
    pub domain: String,

    #[serde(default)]
    #[validate(custom(function = "validate_country"))]
    pub country: Option<String>,

    #[serde(default)]
    #[validate(length(max = 64, message = "os 不能超过64个字符"))]
    pub os: Option<String>,

    #[serde(default, alias = "deviceType", alias = "device_type")]
    #[validate(custom(function = "validate_device"))]
    pub device: Option<String>,

    #[serde(default, alias = "placement_type")]
    #[validate(length(max = 64, message = "placement_type 不能超过64个字符"))]
    pub placement_type: Option<String>,

    #[serde(default)]
    #[validate(length(max = 64, message = "browser 不能超过64个字符"))]
    pub browser: Option<String>,

    /// 规则数值，含义随规则族不同
    #[validate(custom(function = "validate_finite"))]
    pub value: f64,
}

impl RuleInput {
    pub fn new(dimensions: DimensionTuple, value: f64) -> Self {
        Self {
            rule_id: None,
            publisher: dimensions.publisher,
            domain: dimensions.domain,
            country: dimensions.country,
            os: dimensions.os,
            device: dimensions.device,
            placement_type: dimensions.placement_type,
            browser: dimensions.browser,
            value,
        }
    }

    pub fn with_rule_id(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    /// 原始维度（未规范化）
    pub fn dimensions(&self) -> DimensionTuple {
        DimensionTuple {
            publisher: self.publisher.clone(),
            domain: self.domain.clone(),
            country: self.country.clone(),
            os: self.os.clone(),
            device: self.device.clone(),
            placement_type: self.placement_type.clone(),
            browser: self.browser.clone(),
        }
    }
}

fn is_wildcard(value: &str) -> bool {
    matches!(value.trim(), "" | "*" | ".*")
}

/// publisher 与 domain 规范化后不能为空或通配
fn validate_required(value: &str) -> Result<(), ValidationError> {
    if compiler::normalize_dimension(Some(value)).is_some() {
        Ok(())
    } else {
        Err(ValidationError::new("required")
            .with_message("publisher 与 domain 不能为空或通配符".into()))
    }
}

fn validate_country(country: &str) -> Result<(), ValidationError> {
    if is_wildcard(country) {
        return Ok(());
    }
    let trimmed = country.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        Err(ValidationError::new("country").with_message("country 必须是两位字母国家代码".into()))
    }
}

fn validate_device(device: &str) -> Result<(), ValidationError> {
    if is_wildcard(device) {
        return Ok(());
    }
    let normalized = device.trim().to_ascii_lowercase();
    if DEVICE_TYPES.contains(&normalized.as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("device")
            .with_message(format!("不支持的设备类型: {}", device).into()))
    }
}

fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("value").with_message("value 必须为有限数值".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RuleInput {
        RuleInput::new(
            DimensionTuple::new("20814", "stream-together.org")
                .with_country("IL")
                .with_device("Mobile"),
            1.2,
        )
    }

    #[test]
    fn test_valid_input() {
        assert!(input().validate().is_ok());
    }

    #[test]
    fn test_invalid_country_and_device() {
        let mut request = input();
        request.country = Some("isr".to_string());
        assert!(request.validate().is_err());

        let mut request = input();
        request.device = Some("watch".to_string());
        assert!(request.validate().is_err());

        let mut request = input();
        request.device = Some("*".to_string());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_blank_publisher_domain_and_infinite_value() {
        let mut request = input();
        request.publisher = String::new();
        assert!(request.validate().is_err());

        let mut request = input();
        request.domain = "   ".to_string();
        assert!(request.validate().is_err());

        let mut request = input();
        request.publisher = " * ".to_string();
        assert!(request.validate().is_err());

        let mut request = input();
        request.value = f64::INFINITY;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_deserialize_accepts_both_casings() {
        let json = r#"{"ruleId":null,"publisher":"1","domain":"a.com","deviceType":"ctv","placementType":"video","value":0.5}"#;
        let request: RuleInput = serde_json::from_str(json).unwrap();
        assert_eq!(request.device.as_deref(), Some("ctv"));
        assert_eq!(request.placement_type.as_deref(), Some("video"));

        let json = r#"{"publisher":"1","domain":"a.com","placement_type":"banner","value":2}"#;
        let request: RuleInput = serde_json::from_str(json).unwrap();
        assert_eq!(request.placement_type.as_deref(), Some("banner"));
        assert!(request.rule_id.is_none());
    }
}
