//! 规则特异度排序
//!
//! 特异度 = 非通配细分维度的个数。排序稳定：同分规则保持存储读取顺序。

use std::cmp::Reverse;

use crate::models::{DimensionTuple, TargetingRule};

/// 计算特异度（0..=5）
pub fn specificity(dimensions: &DimensionTuple) -> usize {
    dimensions
        .refinements()
        .iter()
        .filter(|v| v.is_some())
        .count()
}

/// 按特异度降序稳定排序
pub fn rank(rules: &mut [TargetingRule]) {
    rank_by_key(rules, |rule| &rule.dimensions);
}

/// 对任意携带维度的元素排序
pub fn rank_by_key<T, F>(items: &mut [T], dimensions: F)
where
    F: Fn(&T) -> &DimensionTuple,
{
    // sort_by_key 为稳定排序
    items.sort_by_key(|item| Reverse(specificity(dimensions(item))));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn rule(dimensions: DimensionTuple, value: f64) -> TargetingRule {
        TargetingRule {
            rule_id: Uuid::new_v4(),
            dimensions,
            value,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_specificity() {
        let base = DimensionTuple::new("1", "a.com");
        assert_eq!(specificity(&base), 0);
        assert_eq!(
            specificity(&base.clone().with_country("us").with_device("mobile")),
            2
        );
        assert_eq!(
            specificity(
                &base
                    .with_country("us")
                    .with_os("ios")
                    .with_device("mobile")
                    .with_placement_type("banner")
                    .with_browser("safari")
            ),
            5
        );
    }

    #[test]
    fn test_device_only_rule_sorts_after_country_rules() {
        let base = DimensionTuple::new("20814", "stream-together.org").with_device("mobile");
        let mut rules = vec![
            rule(base.clone(), 12.0),
            rule(base.clone().with_country("il"), 11.0),
            rule(base.clone().with_country("us"), 14.0),
        ];

        rank(&mut rules);

        let values: Vec<f64> = rules.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![11.0, 14.0, 12.0]);
    }

    #[test]
    fn test_ties_keep_read_order() {
        let base = DimensionTuple::new("1", "a.com");
        let mut rules: Vec<TargetingRule> = ["fr", "de", "us", "il"]
            .iter()
            .enumerate()
            .map(|(i, c)| rule(base.clone().with_country(*c), i as f64))
            .collect();
        rules.insert(2, rule(base.clone().with_country("us").with_os("ios"), 99.0));

        rank(&mut rules);

        let values: Vec<f64> = rules.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![99.0, 0.0, 1.0, 2.0, 3.0]);
    }
}
