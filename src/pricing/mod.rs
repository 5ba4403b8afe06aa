//! # 额度计价
//!
//! 基于模型倍率、补全倍率、缓存倍率与分组倍率计算请求的额度花费，
//! 也支持按次计费的固定价格模型。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::providers::Usage;

/// 1 美元对应的额度
pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;

/// 定价配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub quota_per_unit: f64,
    /// 模型倍率
    pub model_ratio: HashMap<String, f64>,
    /// 补全倍率（相对提示 token）
    pub completion_ratio: HashMap<String, f64>,
    /// 缓存命中 token 倍率
    pub cache_ratio: HashMap<String, f64>,
    /// 按次计费价格（美元）
    pub model_price: HashMap<String, f64>,
    /// 分组倍率
    pub group_ratio: HashMap<String, f64>,
    /// 用户分组 -> 该分组用户的令牌可额外使用的分组
    pub usable_groups: HashMap<String, Vec<String>>,
    /// 未配置模型时使用的倍率，为空则拒绝请求
    pub default_model_ratio: Option<f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            cache_ratio: HashMap::new(),
            model_price: HashMap::new(),
            group_ratio: HashMap::from([("default".to_string(), 1.0)]),
            usable_groups: HashMap::new(),
            default_model_ratio: None,
        }
    }
}

/// 单次请求的定价数据
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceData {
    /// 是否按次计费
    pub use_price: bool,
    pub model_price: f64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub group_ratio: f64,
    pub quota_per_unit: f64,
}

impl PricingConfig {
    /// 分组倍率，不存在表示分组不可解析
    pub fn group_ratio(&self, group: &str) -> Option<f64> {
        self.group_ratio.get(group).copied()
    }

    /// 用户分组下令牌可选择的分组（总是包含用户自身分组）
    pub fn is_usable_group(&self, user_group: &str, token_group: &str) -> bool {
        user_group == token_group
            || self
                .usable_groups
                .get(user_group)
                .is_some_and(|groups| groups.iter().any(|g| g == token_group))
    }

    /// 查找模型与分组的定价
    pub fn price_for(&self, model: &str, group: &str) -> Result<PriceData> {
        let group_ratio = self
            .group_ratio(group)
            .ok_or_else(|| ProxyError::forbidden(format!("group {group} is not configured")))?;

        if let Some(price) = self.model_price.get(model) {
            return Ok(PriceData {
                use_price: true,
                model_price: *price,
                model_ratio: 0.0,
                completion_ratio: 0.0,
                cache_ratio: 0.0,
                group_ratio,
                quota_per_unit: self.quota_per_unit,
            });
        }

        let model_ratio = self
            .model_ratio
            .get(model)
            .copied()
            .or(self.default_model_ratio)
            .ok_or_else(|| crate::config_error!("model {} ratio or price not configured", model))?;

        Ok(PriceData {
            use_price: false,
            model_price: 0.0,
            model_ratio,
            completion_ratio: self.completion_ratio.get(model).copied().unwrap_or(1.0),
            cache_ratio: self.cache_ratio.get(model).copied().unwrap_or(1.0),
            group_ratio,
            quota_per_unit: self.quota_per_unit,
        })
    }
}

impl PriceData {
    /// 综合倍率
    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio
    }

    /// 按用量计算额度
    ///
    /// `((prompt - cached) + cached * cache_ratio + completion * completion_ratio) * ratio`，
    /// 倍率非零时最少收取 1。
    pub fn quota_for(&self, usage: &Usage) -> i64 {
        if self.use_price {
            return (self.model_price * self.quota_per_unit * self.group_ratio).round() as i64;
        }

        let cached = i64::from(usage.cached_tokens.min(usage.prompt_tokens));
        let prompt = i64::from(usage.prompt_tokens) - cached;
        let cached_cost = (cached as f64 * self.cache_ratio).round() as i64;
        let completion_cost =
            (f64::from(usage.completion_tokens) * self.completion_ratio).round() as i64;

        let ratio = self.ratio();
        let quota = ((prompt + cached_cost + completion_cost) as f64 * ratio).round() as i64;
        if ratio != 0.0 && quota <= 0 { 1 } else { quota }
    }

    /// 预估额度：以 `max_tokens`（缺省用默认预扣 token 数）作为补全长度估计
    pub fn estimate_quota(
        &self,
        request_id: &str,
        prompt_tokens: u32,
        max_tokens: Option<u32>,
        default_completion_estimate: i64,
    ) -> i64 {
        let completion_estimate = max_tokens
            .filter(|m| *m > 0)
            .map_or(default_completion_estimate.max(0), i64::from);
        let usage = Usage {
            prompt_tokens,
            completion_tokens: u32::try_from(completion_estimate).unwrap_or(u32::MAX),
            ..Usage::default()
        };
        let quota = self.quota_for(&usage);
        ldebug!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "estimate_quota",
            "Estimated request quota",
            prompt_tokens = prompt_tokens,
            completion_estimate = completion_estimate,
            quota = quota,
            use_price = self.use_price
        );
        quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PricingConfig {
        let mut config = PricingConfig::default();
        config.model_ratio.insert("gpt-4".to_string(), 15.0);
        config.completion_ratio.insert("gpt-4".to_string(), 2.0);
        config.cache_ratio.insert("gpt-4".to_string(), 0.5);
        config.model_price.insert("mj-imagine".to_string(), 0.1);
        config.group_ratio.insert("vip".to_string(), 0.5);
        config
    }

    #[test]
    fn ratio_formula_matches_components() {
        let price = config().price_for("gpt-4", "default").unwrap();
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            cached_tokens: 40,
            reasoning_tokens: 0,
        };
        // (60 + 20 + 100) * 15 * 1
        assert_eq!(price.quota_for(&usage), 2700);
    }

    #[test]
    fn group_ratio_scales_quota() {
        let price = config().price_for("gpt-4", "vip").unwrap();
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 0,
            ..Usage::default()
        };
        assert_eq!(price.quota_for(&usage), 75);
    }

    #[test]
    fn tiny_usage_charges_at_least_one() {
        let mut cfg = config();
        cfg.model_ratio.insert("cheap".to_string(), 0.001);
        let price = cfg.price_for("cheap", "default").unwrap();
        let usage = Usage {
            prompt_tokens: 1,
            ..Usage::default()
        };
        assert_eq!(price.quota_for(&usage), 1);
    }

    #[test]
    fn flat_price_ignores_tokens() {
        let price = config().price_for("mj-imagine", "vip").unwrap();
        assert!(price.use_price);
        let usage = Usage {
            prompt_tokens: 9999,
            completion_tokens: 9999,
            ..Usage::default()
        };
        assert_eq!(price.quota_for(&usage), 25_000);
    }

    #[test]
    fn usable_groups_include_own_group() {
        let mut cfg = config();
        cfg.usable_groups
            .insert("default".to_string(), vec!["vip".to_string()]);
        assert!(cfg.is_usable_group("default", "default"));
        assert!(cfg.is_usable_group("default", "vip"));
        assert!(!cfg.is_usable_group("vip", "default"));
    }

    #[test]
    fn unknown_group_is_rejected() {
        let err = config().price_for("gpt-4", "ghost").unwrap_err();
        assert!(matches!(err, ProxyError::Authz { .. }));
    }

    #[test]
    fn unknown_model_without_default_is_rejected() {
        assert!(config().price_for("unknown-model", "default").is_err());
        let mut cfg = config();
        cfg.default_model_ratio = Some(2.0);
        assert!(cfg.price_for("unknown-model", "default").is_ok());
    }

    #[test]
    fn estimate_uses_max_tokens_or_default() {
        let price = config().price_for("gpt-4", "default").unwrap();
        // (10 + 20 * 2) * 15
        assert_eq!(price.estimate_quota("t", 10, Some(20), 500), 750);
        // (10 + 500 * 2) * 15
        assert_eq!(price.estimate_quota("t", 10, None, 500), 15_150);
    }
}
