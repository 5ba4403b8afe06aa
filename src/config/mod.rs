//! # 配置管理模块
//!
//! 处理应用配置加载、环境变量覆盖和验证

mod app_config;

pub use app_config::{
    AppConfig, CacheConfig, CacheType, ClaudeSettings, DatabaseConfig, GeminiSettings,
    RateLimitConfig, RateLimitTier, RedisConfig, RelayConfig, ServerConfig,
};

use std::env;
use std::path::Path;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "RELAY_GATEWAY_CONFIG";

/// 加载配置文件
///
/// 优先读取 `RELAY_GATEWAY_CONFIG`，否则读取 `config/config.{RUST_ENV}.toml`；
/// 文件不存在时使用默认配置。
pub fn load_config() -> Result<AppConfig> {
    let config_file =
        resolve_config_path(env::var(CONFIG_PATH_ENV).ok(), env::var("RUST_ENV").ok());

    let mut config = if Path::new(&config_file).exists() {
        load_config_file(Path::new(&config_file))?
    } else {
        lwarn!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "config_missing",
            &format!("配置文件不存在，使用默认配置: {config_file}")
        );
        AppConfig::default()
    };

    apply_env_overrides(&mut config, env::vars())?;
    config.validate().map_err(ProxyError::config)?;
    Ok(config)
}

/// 显式路径优先，否则按运行环境拼出默认路径
fn resolve_config_path(explicit: Option<String>, rust_env: Option<String>) -> String {
    explicit.filter(|path| !path.is_empty()).unwrap_or_else(|| {
        let env = rust_env.unwrap_or_else(|| "dev".to_string());
        format!("config/config.{env}.toml")
    })
}

/// 读取并解析单个配置文件
pub fn load_config_file(path: &Path) -> Result<AppConfig> {
    let config_content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
    })?;

    let config: AppConfig = toml::from_str(&config_content).map_err(|e| {
        ProxyError::config_with_source(format!("TOML解析失败 - 配置文件: {}", path.display()), e)
    })?;

    config.validate().map_err(ProxyError::config)?;
    Ok(config)
}

/// 应用 `RELAY_*` 环境变量覆盖
pub fn apply_env_overrides<I>(config: &mut AppConfig, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(name) = key.strip_prefix("RELAY_") else {
            continue;
        };
        if name == "GATEWAY_CONFIG" {
            continue;
        }

        ldebug!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "env_override",
            &format!("应用环境变量覆盖: {key}"),
            value = %mask_secret(&key, &value)
        );

        match name {
            "SERVER_HOST" => config.server.host = value,
            "SERVER_PORT" => config.server.port = parse_value(&key, &value)?,
            "DATABASE_URL" => config.database.url = value,
            "REDIS_URL" => {
                config.cache.cache_type = CacheType::Redis;
                config.cache.redis.get_or_insert_with(RedisConfig::default).url = value;
            }
            "TIMEOUT" => config.relay.relay_timeout_seconds = parse_value(&key, &value)?,
            "RETRY_TIMES" => config.relay.retry_times = parse_value(&key, &value)?,
            "STREAM_ENABLED" => config.relay.stream_enabled = parse_value(&key, &value)?,
            "PRE_CONSUMED_QUOTA" => config.relay.pre_consumed_quota = parse_value(&key, &value)?,
            "TRUSTED_QUOTA_MULTIPLIER" => {
                config.relay.trusted_quota_multiplier = parse_value(&key, &value)?;
            }
            "GLOBAL_API_RATE_LIMIT" => {
                config.rate_limit.global_api.max_requests = parse_value(&key, &value)?;
            }
            "GLOBAL_WEB_RATE_LIMIT" => {
                config.rate_limit.global_web.max_requests = parse_value(&key, &value)?;
            }
            "CLAUDE_DEFAULT_MAX_TOKENS" => {
                config.claude.default_max_tokens = parse_value(&key, &value)?;
            }
            _ => {
                lwarn!(
                    "system",
                    LogStage::Configuration,
                    LogComponent::Config,
                    "unknown_override",
                    &format!("未知的配置项，忽略环境变量覆盖: {key}")
                );
            }
        }
    }
    Ok(())
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|e| ProxyError::config_with_source(format!("无效的配置值: {key}={value}"), e))
}

fn mask_secret<'a>(key: &str, value: &'a str) -> &'a str {
    if key.contains("URL") || key.contains("KEY") || key.contains("SECRET") {
        "***"
    } else {
        value
    }
}
