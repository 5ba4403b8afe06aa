//! # 日志配置模块
//!
//! 基于 tracing 的结构化日志：统一的阶段/组件字段与调用宏

use std::env;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Startup,
    Shutdown,
    Configuration,
    RequestStart,
    Authentication,
    RateLimit,
    Scheduling,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Billing,
    Cache,
    Db,
    BackgroundTask,
    Internal,
    Error,
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    Config,
    Cache,
    Database,
    RateLimiter,
    Distributor,
    Selector,
    ChannelRegistry,
    Relay,
    Billing,
    ClaudeAdapter,
    GeminiAdapter,
    OpenAiAdapter,
    Tokenizer,
    Metrics,
    Server,
}

/// 结构化 info 日志
///
/// `linfo!(request_id, stage, component, operation, message, key = value, ...)`
#[macro_export]
macro_rules! linfo {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($fields:tt)*)?) => {
        ::tracing::info!(
            request_id = %$rid,
            stage = ?$stage,
            component = ?$comp,
            operation = %$op,
            $($($fields)*,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($fields:tt)*)?) => {
        ::tracing::debug!(
            request_id = %$rid,
            stage = ?$stage,
            component = ?$comp,
            operation = %$op,
            $($($fields)*,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($fields:tt)*)?) => {
        ::tracing::warn!(
            request_id = %$rid,
            stage = ?$stage,
            component = ?$comp,
            operation = %$op,
            $($($fields)*,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($fields:tt)*)?) => {
        ::tracing::error!(
            request_id = %$rid,
            stage = ?$stage,
            component = ?$comp,
            operation = %$op,
            $($($fields)*,)?
            "{}",
            $msg
        )
    };
}

/// 初始化优化的日志系统
pub fn init_optimized_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", String::as_str);

    // 默认关闭数据库查询明细
    let default_filter = format!(
        "{level},relay_gateway=debug,sqlx::query=off,sea_orm::query=warn,sqlx=warn"
    );

    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_accept_trailing_fields() {
        init_optimized_logging(Some(&"debug".to_string()));
        linfo!(
            "req-1",
            LogStage::Startup,
            LogComponent::Main,
            "boot",
            "starting",
            port = 8080,
            mode = ?"test"
        );
        ldebug!("req-1", LogStage::Cache, LogComponent::Cache, "cache_lookup", &format!("key={}", "a"));
        lwarn!("req-1", LogStage::RateLimit, LogComponent::RateLimiter, "deny", "denied", key = %"k");
        lerror!("req-1", LogStage::Error, LogComponent::Relay, "fail", "failed");
    }
}
