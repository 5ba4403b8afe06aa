//! # 错误处理测试

use crate::error::{Context, ErrorCategory, ProxyError};
use axum::http::StatusCode;
use std::error::Error;

#[test]
fn test_config_error_with_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "文件不存在");
    let err = ProxyError::config_with_source("配置文件加载失败", io_err);

    assert!(matches!(err, ProxyError::Config { .. }));
    assert!(err.to_string().contains("配置错误: 配置文件加载失败"));
    assert!(err.source().is_some());
}

#[test]
fn test_no_available_channel_names_group_and_model() {
    let err = ProxyError::no_available_channel("default", "gpt-4");
    let (status, code) = err.to_http_response_parts();

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(code, "NO_AVAILABLE_CHANNEL");
    assert_eq!(
        err.to_string(),
        "no available channel for model gpt-4 under group default"
    );
}

#[test]
fn test_consistency_variant_is_distinct() {
    let err = ProxyError::channel_inconsistent("vip", "claude-3-opus");
    let (status, code) = err.to_http_response_parts();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(code, "CHANNEL_INDEX_INCONSISTENT");
}

#[test]
fn test_rate_limit_and_lock_timeout_are_distinguishable() {
    let denied = ProxyError::rate_limit("too many requests");
    let timeout = ProxyError::lock_timeout("failed to acquire", 30);

    assert_eq!(denied.to_http_response_parts().0, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(timeout.to_http_response_parts().0, StatusCode::TOO_MANY_REQUESTS);
    assert_ne!(
        denied.to_http_response_parts().1,
        timeout.to_http_response_parts().1
    );
}

#[test]
fn test_upstream_retryable_classification() {
    assert!(ProxyError::upstream("boom", 500).is_retryable());
    assert!(ProxyError::upstream("slow down", 429).is_retryable());
    assert!(!ProxyError::upstream("bad request", 400).is_retryable());
    assert!(ProxyError::timeout("relay timeout", 30).is_retryable());
    assert!(!ProxyError::validation("model is required").is_retryable());
}

#[test]
fn test_upstream_status_passthrough() {
    let err = ProxyError::upstream("not found", 404);
    assert_eq!(err.to_http_response_parts().0, StatusCode::NOT_FOUND);
    assert_eq!(err.category(), ErrorCategory::Client);
}

#[test]
fn test_envelope_shape() {
    let err = ProxyError::validation("model is required");
    let value = serde_json::to_value(err.to_envelope()).unwrap();

    assert_eq!(value["error"]["message"], "model is required");
    assert_eq!(value["error"]["type"], "invalid_request_error");
    assert_eq!(value["error"]["code"], "invalid_request");
    assert_eq!(value["error"]["param"], "");
}

#[test]
fn test_envelope_hides_internal_details() {
    let err = ProxyError::database("connection refused on 10.0.0.3");
    assert_eq!(err.to_envelope().error.message, "internal server error");
    assert_eq!(err.category(), ErrorCategory::Server);
}

#[test]
fn test_error_context_trait() {
    let result: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "权限不足",
    ));

    let err = result.context("读取配置文件失败").unwrap_err();
    assert!(matches!(err, ProxyError::Context { .. }));
    assert!(err.to_string().starts_with("读取配置文件失败"));
    assert_eq!(
        err.to_http_response_parts().0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_auto_conversion_from_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let proxy_err: ProxyError = json_err.into();
    assert!(matches!(proxy_err, ProxyError::Serialization { .. }));
}

#[test]
fn test_macros() {
    fn check(max_tokens: u32) -> crate::error::Result<()> {
        crate::ensure_validation!(max_tokens < 100, "max_tokens {} is invalid", max_tokens);
        Ok(())
    }

    assert!(check(10).is_ok());
    let err = check(1000).unwrap_err();
    assert_eq!(err.to_string(), "max_tokens 1000 is invalid");
    assert!(matches!(
        crate::internal_error!("x {}", 1),
        ProxyError::Internal { .. }
    ));
}
