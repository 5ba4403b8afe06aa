//! # 适配器错误
//!
//! 适配器层只关心协议转换与上游交互，统一产出 `ProviderError`，
//! 由中继层转换为对外的 `ProxyError`。

use super::ProxyError;

/// 适配器错误类型
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Invalid request format: {0}")]
    InvalidRequest(String),

    /// 上游返回非 2xx，`message` 取自上游错误体
    #[error("Provider API error: {status_code} - {message}")]
    ApiError {
        status_code: u16,
        error_type: String,
        message: String,
    },

    /// 2xx 响应但没有任何候选结果
    #[error("No candidates returned")]
    EmptyCandidates,

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Response parse error: {0}")]
    ResponseParseError(String),

    #[error("Stream parse error: {0}")]
    StreamParseError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn api<T: Into<String>, M: Into<String>>(status_code: u16, error_type: T, message: M) -> Self {
        Self::ApiError {
            status_code,
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<ProviderError> for ProxyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidRequest(message)
            | ProviderError::UnsupportedOperation(message) => Self::validation(message),
            ProviderError::ApiError {
                status_code,
                message,
                ..
            } => Self::upstream(message, status_code),
            ProviderError::EmptyCandidates => Self::upstream("No candidates returned", 500),
            ProviderError::Timeout(message) => Self::timeout(message, 0),
            ProviderError::NetworkError(message) => Self::network(message),
            ProviderError::SerializationError(message) => Self::internal(message),
            ProviderError::ConfigurationError(message) => Self::config(message),
            ProviderError::ResponseParseError(message) | ProviderError::StreamParseError(message) => {
                Self::upstream(message, 500)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_status_and_retryability() {
        let err: ProxyError = ProviderError::api(529, "overloaded_error", "Overloaded").into();
        assert!(err.is_retryable());
        assert_eq!(err.to_http_response_parts().0.as_u16(), 529);

        let err: ProxyError = ProviderError::api(400, "invalid_request_error", "bad").into();
        assert!(!err.is_retryable());
        assert!(err.is_channel_failure());
    }

    #[test]
    fn empty_candidates_is_server_error() {
        let err: ProxyError = ProviderError::EmptyCandidates.into();
        assert_eq!(err.to_http_response_parts().0.as_u16(), 500);
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_request_is_client_error() {
        let err: ProxyError = ProviderError::InvalidRequest("x".to_string()).into();
        assert_eq!(err.to_http_response_parts().0.as_u16(), 400);
    }
}
