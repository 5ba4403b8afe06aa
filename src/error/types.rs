//! # 错误类型定义

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ErrorCategory;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 缓存相关错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误（上游不可达、连接中断）
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 请求字段缺失或非法
    #[error("{message}")]
    Validation { message: String },

    /// 令牌、渠道、IP 或模型权限不满足
    #[error("{message}")]
    Authz { message: String, unauthorized: bool },

    /// 用户或令牌额度不足
    #[error("{message}")]
    InsufficientQuota { message: String },

    /// 没有满足分组与模型条件的渠道
    #[error("no available channel for model {model} under group {group}")]
    NoAvailableChannel {
        group: String,
        model: String,
        /// 索引命中但渠道记录缺失，属于缓存一致性问题
        consistency: bool,
    },

    /// 准入被拒绝
    #[error("{message}")]
    RateLimit { message: String },

    /// 等待限流放行超时
    #[error("{message}")]
    LockTimeout { message: String, waited_seconds: u64 },

    /// 上游返回非 2xx 或传输失败
    #[error("上游错误({status}): {message}")]
    Upstream {
        message: String,
        status: u16,
        retryable: bool,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 中继超时
    #[error("中继超时: {message}")]
    Timeout { message: String, timeout_seconds: u64 },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

/// 统一错误响应体 `{error:{message,type,param,code}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: String,
    pub code: String,
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    pub fn to_http_response_parts(&self) -> (StatusCode, &str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Database { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Self::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Serialization { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            Self::Validation { .. } => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Self::Authz {
                unauthorized: true, ..
            } => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Authz { .. } => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::InsufficientQuota { .. } => (StatusCode::FORBIDDEN, "INSUFFICIENT_USER_QUOTA"),
            Self::NoAvailableChannel {
                consistency: true, ..
            } => (StatusCode::SERVICE_UNAVAILABLE, "CHANNEL_INDEX_INCONSISTENT"),
            Self::NoAvailableChannel { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_AVAILABLE_CHANNEL")
            }
            Self::RateLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED"),
            Self::LockTimeout { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_LOCK_TIMEOUT"),
            Self::Upstream { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "UPSTREAM_ERROR",
            ),
            Self::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "RELAY_TIMEOUT"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 错误分类，用于监控
    pub fn category(&self) -> ErrorCategory {
        if self.to_http_response_parts().0.is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }

    /// 是否允许换渠道重试（超时、5xx、上游限流）
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 是否需要记录渠道失败
    pub fn is_channel_failure(&self) -> bool {
        match self {
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Context { source, .. } => source.is_channel_failure(),
            _ => false,
        }
    }

    /// 对外错误类型
    fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::Authz { .. } | Self::InsufficientQuota { .. } => {
                "invalid_request_error"
            }
            Self::RateLimit { .. } | Self::LockTimeout { .. } => "rate_limit_error",
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Network { .. } => {
                "upstream_error"
            }
            Self::Context { source, .. } => source.error_type(),
            _ => "server_error",
        }
    }

    /// 生成对外的错误响应体
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let (_, code) = self.to_http_response_parts();
        ErrorEnvelope {
            error: ErrorBody {
                message: self.client_message(),
                error_type: self.error_type().to_string(),
                param: String::new(),
                code: code.to_ascii_lowercase(),
            },
        }
    }

    /// 对外可见的错误信息，内部错误不暴露来源细节
    pub fn client_message(&self) -> String {
        match self {
            Self::Context { source, .. } => source.client_message(),
            Self::Database { .. } | Self::Cache { .. } | Self::Io { .. } | Self::Config { .. } => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的数据库错误
    pub fn database_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// 403 权限错误
    pub fn forbidden<T: Into<String>>(message: T) -> Self {
        Self::Authz {
            message: message.into(),
            unauthorized: false,
        }
    }

    /// 401 认证错误
    pub fn unauthorized<T: Into<String>>(message: T) -> Self {
        Self::Authz {
            message: message.into(),
            unauthorized: true,
        }
    }

    pub fn insufficient_quota<T: Into<String>>(message: T) -> Self {
        Self::InsufficientQuota {
            message: message.into(),
        }
    }

    /// 没有可用渠道
    pub fn no_available_channel<G: Into<String>, M: Into<String>>(group: G, model: M) -> Self {
        Self::NoAvailableChannel {
            group: group.into(),
            model: model.into(),
            consistency: false,
        }
    }

    /// 渠道索引与存储不一致
    pub fn channel_inconsistent<G: Into<String>, M: Into<String>>(group: G, model: M) -> Self {
        Self::NoAvailableChannel {
            group: group.into(),
            model: model.into(),
            consistency: true,
        }
    }

    /// 创建速率限制错误
    pub fn rate_limit<T: Into<String>>(message: T) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    /// 创建限流等待超时错误
    pub fn lock_timeout<T: Into<String>>(message: T, waited_seconds: u64) -> Self {
        Self::LockTimeout {
            message: message.into(),
            waited_seconds,
        }
    }

    /// 创建上游错误，按状态码判断能否换渠道重试
    pub fn upstream<T: Into<String>>(message: T, status: u16) -> Self {
        Self::Upstream {
            message: message.into(),
            status,
            retryable: status == 429 || status == 408 || status >= 500,
            source: None,
        }
    }

    /// 创建带来源的上游错误
    pub fn upstream_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        status: u16,
        source: E,
    ) -> Self {
        Self::Upstream {
            message: message.into(),
            status,
            retryable: status == 429 || status == 408 || status >= 500,
            source: Some(source.into()),
        }
    }

    /// 创建中继超时错误
    pub fn timeout<T: Into<String>>(message: T, timeout_seconds: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_seconds,
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, _) = self.to_http_response_parts();
        if let Self::LockTimeout { message, .. } = &self {
            let body = serde_json::json!({
                "error": {
                    "code": 429,
                    "message": message,
                    "status": "RATE_LIMIT_EXCEEDED",
                }
            });
            return (status, Json(body)).into_response();
        }
        (status, Json(self.to_envelope())).into_response()
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<sea_orm::error::DbErr> for ProxyError {
    fn from(err: sea_orm::error::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

// Redis错误转换
impl From<redis::RedisError> for ProxyError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis操作失败", err)
    }
}

// Reqwest错误转换：超时与连接失败均视为可重试
impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                message: err.to_string(),
                timeout_seconds: 0,
            };
        }
        Self::network_with_source("HTTP请求失败", err)
    }
}
