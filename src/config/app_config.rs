//! # 应用配置结构定义

use serde::{Deserialize, Serialize};

use crate::pricing::PricingConfig;

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP 服务配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 缓存配置
    pub cache: CacheConfig,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
    /// 中继与结算配置
    pub relay: RelayConfig,
    /// Claude 适配器设置
    pub claude: ClaudeSettings,
    /// Gemini 适配器设置
    pub gemini: GeminiSettings,
    /// 倍率与定价
    pub pricing: PricingConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/relay.db".to_string(),
            max_connections: 10,
        }
    }
}

/// 缓存类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 内存缓存（单实例）
    #[default]
    Memory,
    /// Redis缓存（多实例共享）
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 缓存类型
    pub cache_type: CacheType,
    /// 内存缓存最大条目数
    pub memory_max_entries: usize,
    /// 默认过期时间（秒）
    pub default_ttl: u64,
    /// Redis 缓存配置
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            memory_max_entries: 100_000,
            default_ttl: 300,
            redis: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接超时时间（秒）
    pub connection_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: 10,
        }
    }
}

/// 单个限流层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub enabled: bool,
    /// 窗口内最大请求数
    pub max_requests: u32,
    /// 窗口长度（秒）
    pub window_seconds: u64,
}

impl RateLimitTier {
    pub const fn new(enabled: bool, max_requests: u32, window_seconds: u64) -> Self {
        Self {
            enabled,
            max_requests,
            window_seconds,
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_api: RateLimitTier,
    pub global_web: RateLimitTier,
    pub critical: RateLimitTier,
    pub upload: RateLimitTier,
    pub download: RateLimitTier,
    /// 滑动窗口键的过期时间（秒）
    pub key_expiration_seconds: u64,
    /// 模型 RPM 配置缓存时长（毫秒）
    pub limit_config_cache_ms: u64,
    /// 模型 RPM 窗口（秒）
    pub model_rpm_window_seconds: u64,
    /// 等待放行时的最小/最大退避（秒）
    pub backoff_min_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_api: RateLimitTier::new(true, 180, 180),
            global_web: RateLimitTier::new(true, 60, 180),
            critical: RateLimitTier::new(true, 20, 1200),
            upload: RateLimitTier::new(true, 10, 60),
            download: RateLimitTier::new(true, 10, 60),
            key_expiration_seconds: 20 * 60,
            limit_config_cache_ms: 1000,
            model_rpm_window_seconds: 60,
            backoff_min_seconds: 1,
            backoff_max_seconds: 60,
        }
    }
}

/// 中继与结算配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 无法估算补全长度时的预扣额度
    pub pre_consumed_quota: i64,
    /// 换渠道重试次数
    pub retry_times: u32,
    /// 中继超时（秒），0 表示不限制
    pub relay_timeout_seconds: u64,
    /// 额度超过预估花费该倍数时跳过预扣
    pub trusted_quota_multiplier: i64,
    /// 异步退款的并发上限
    pub refund_workers: usize,
    /// max_tokens 上限
    pub max_tokens_ceiling: u64,
    /// 连续失败多少次后自动禁用渠道，0 表示不禁用
    pub channel_failure_threshold: u32,
    /// 渠道缓存刷新周期（秒）
    pub channel_refresh_seconds: u64,
    /// 是否允许流式请求
    pub stream_enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pre_consumed_quota: 500,
            retry_times: 0,
            relay_timeout_seconds: 0,
            trusted_quota_multiplier: 100,
            refund_workers: 16,
            max_tokens_ceiling: (i32::MAX / 2) as u64,
            channel_failure_threshold: 0,
            channel_refresh_seconds: 60,
            stream_enabled: true,
        }
    }
}

/// Claude 适配器设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeSettings {
    /// 请求未携带 max_tokens 时使用
    pub default_max_tokens: u32,
    /// 思考预算占 max_tokens 的比例
    pub thinking_budget_percentage: f64,
    /// 是否识别 `-thinking` 模型后缀
    pub thinking_adapter_enabled: bool,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            default_max_tokens: 8192,
            thinking_budget_percentage: 0.8,
            thinking_adapter_enabled: true,
        }
    }
}

/// Gemini 适配器设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    /// 渠道未配置 api_version 时使用
    pub default_api_version: String,
    /// 安全设置阈值
    pub safety_setting: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            default_api_version: "v1beta".to_string(),
            safety_setting: "BLOCK_NONE".to_string(),
        }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be greater than 0".to_string());
        }
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        match self.cache.cache_type {
            CacheType::Memory => {
                if self.cache.redis.is_some() {
                    return Err("cache.redis 配置仅在 cache_type = \"redis\" 时可用".to_string());
                }
            }
            CacheType::Redis => {
                let redis = self
                    .cache
                    .redis
                    .as_ref()
                    .ok_or_else(|| "Redis cache configuration must be provided".to_string())?;
                if redis.url.is_empty() {
                    return Err("Redis URL cannot be empty".to_string());
                }
            }
        }

        let rl = &self.rate_limit;
        if rl.backoff_min_seconds == 0 || rl.backoff_min_seconds > rl.backoff_max_seconds {
            return Err("rate_limit backoff range is invalid".to_string());
        }
        if rl.model_rpm_window_seconds == 0 {
            return Err("rate_limit.model_rpm_window_seconds must be greater than 0".to_string());
        }
        if self.relay.trusted_quota_multiplier <= 0 {
            return Err("relay.trusted_quota_multiplier must be positive".to_string());
        }
        if self.relay.refund_workers == 0 {
            return Err("relay.refund_workers must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.claude.thinking_budget_percentage) {
            return Err("claude.thinking_budget_percentage must be within [0, 1]".to_string());
        }
        Ok(())
    }
}
