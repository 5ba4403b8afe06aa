//! # 缓存键命名规范
//!
//! 定义统一的缓存键生成和管理策略

use serde::{Deserialize, Serialize};
use std::fmt;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheKey {
    /// 按 IP 的限流窗口 - `rateLimit:{mark}{client_ip}`
    RateLimit { mark: String, subject: String },

    /// 按 (用户, 令牌, 模型) 的 RPM 窗口 - `rateLimit:UTM:{user_id}:{token_name}:{model}:`
    ModelRpm {
        user_id: i32,
        token_name: String,
        model: String,
    },

    /// 模型限流配置缓存 - `limit_cache:{user_id}:{token_name}:{model}`
    LimitConfig {
        user_id: i32,
        token_name: String,
        model: String,
    },

    /// 渠道连续失败计数 - `channel:failures:{channel_id}`
    ChannelFailures { channel_id: i32 },

    /// 自定义键 - `custom:{prefix}:{key}`
    Custom { prefix: String, key: String },
}

impl CacheKey {
    /// 生成缓存键字符串
    #[must_use]
    pub fn build(&self) -> String {
        match self {
            Self::RateLimit { mark, subject } => format!("rateLimit:{mark}{subject}"),
            Self::ModelRpm {
                user_id,
                token_name,
                model,
            } => format!(
                "rateLimit:UTM:{user_id}:{}:{}:",
                sanitize_segment(token_name),
                sanitize_segment(model)
            ),
            Self::LimitConfig {
                user_id,
                token_name,
                model,
            } => format!(
                "limit_cache:{user_id}:{}:{}",
                sanitize_segment(token_name),
                sanitize_segment(model)
            ),
            Self::ChannelFailures { channel_id } => format!("channel:failures:{channel_id}"),
            Self::Custom { prefix, key } => format!("custom:{prefix}:{key}"),
        }
    }

    /// 获取缓存键的命名空间
    #[must_use]
    pub const fn namespace(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } | Self::ModelRpm { .. } => "rateLimit",
            Self::LimitConfig { .. } => "limit_cache",
            Self::ChannelFailures { .. } => "channel",
            Self::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// 键片段中不允许出现分隔符
fn sanitize_segment(segment: &str) -> String {
    segment.replace([':', ' ', '\n'], "_")
}

/// 缓存键构建器
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// 构建 IP 维度的限流键
    #[must_use]
    pub fn rate_limit(mark: &str, subject: &str) -> CacheKey {
        CacheKey::RateLimit {
            mark: mark.to_string(),
            subject: subject.to_string(),
        }
    }

    /// 构建模型 RPM 限流键
    #[must_use]
    pub fn model_rpm(user_id: i32, token_name: &str, model: &str) -> CacheKey {
        CacheKey::ModelRpm {
            user_id,
            token_name: token_name.to_string(),
            model: model.to_string(),
        }
    }

    /// 构建模型限流配置缓存键
    #[must_use]
    pub fn limit_config(user_id: i32, token_name: &str, model: &str) -> CacheKey {
        CacheKey::LimitConfig {
            user_id,
            token_name: token_name.to_string(),
            model: model.to_string(),
        }
    }

    #[must_use]
    pub const fn channel_failures(channel_id: i32) -> CacheKey {
        CacheKey::ChannelFailures { channel_id }
    }

    /// 构建自定义缓存键
    #[must_use]
    pub fn custom(prefix: &str, key: &str) -> CacheKey {
        CacheKey::Custom {
            prefix: prefix.to_string(),
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_build() {
        assert_eq!(
            CacheKeyBuilder::rate_limit("GA", "10.0.0.1").build(),
            "rateLimit:GA10.0.0.1"
        );
        assert_eq!(
            CacheKeyBuilder::model_rpm(7, "default", "gpt-4").build(),
            "rateLimit:UTM:7:default:gpt-4:"
        );
        assert_eq!(
            CacheKeyBuilder::limit_config(7, "default", "gpt-4").build(),
            "limit_cache:7:default:gpt-4"
        );
        assert_eq!(CacheKeyBuilder::channel_failures(3).to_string(), "channel:failures:3");
    }

    #[test]
    fn test_segments_cannot_forge_keys() {
        let key = CacheKeyBuilder::model_rpm(1, "a:b", "m 1");
        assert_eq!(key.build(), "rateLimit:UTM:1:a_b:m_1:");
    }

    #[test]
    fn test_namespace() {
        assert_eq!(CacheKeyBuilder::rate_limit("CT", "ip").namespace(), "rateLimit");
        assert_eq!(
            CacheKeyBuilder::limit_config(1, "t", "m").namespace(),
            "limit_cache"
        );
    }
}
