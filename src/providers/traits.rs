//! # 适配器特征定义
//!
//! 每个供应商实现一个 `ProviderAdapter`：请求转换、地址与请求头构造、
//! 发起请求、响应与流式事件转换。

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use super::sse::{SseEvent, StreamFrame};
use super::types::{
    ConvertedResponse, ProviderError, ProviderResult, RelayMode, RelayRequest, Usage,
};
use crate::channel::VendorType;

/// 一次上游调用的目标与上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub mode: RelayMode,
    /// 已去除末尾斜杠
    pub base_url: String,
    pub api_key: String,
    /// 映射后的上游模型名
    pub upstream_model: String,
    /// 渠道设置中的 API 版本
    pub api_version: Option<String>,
    pub stream: bool,
    /// 本地估算的提示词 token，上游缺失用量时兜底
    pub prompt_tokens: u32,
}

/// 流式转换结束后的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub usage: Usage,
}

/// 有状态的流式事件转换器，每个请求一个
pub trait StreamConverter: Send {
    /// 转换一个上游事件，可能产出零到多帧
    fn on_event(&mut self, event: &SseEvent) -> ProviderResult<Vec<StreamFrame>>;

    /// 上游结束（或客户端断开）后汇总用量，缺失部分本地估算
    fn finish(&mut self) -> StreamSummary;
}

/// AI服务提供商适配器特征
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn vendor(&self) -> VendorType;

    /// 是否支持指定中继模式
    fn supports_mode(&self, mode: RelayMode) -> bool;

    fn build_url(&self, target: &UpstreamTarget) -> ProviderResult<String>;

    fn build_headers(&self, target: &UpstreamTarget) -> ProviderResult<HeaderMap>;

    /// 规范请求转换为上游请求体
    fn convert_request(
        &self,
        request_id: &str,
        request: &RelayRequest,
        target: &UpstreamTarget,
    ) -> ProviderResult<Value>;

    /// 上游 2xx 响应体转换为规范响应
    fn convert_response(
        &self,
        request_id: &str,
        body: &[u8],
        target: &UpstreamTarget,
    ) -> ProviderResult<ConvertedResponse>;

    fn stream_converter(&self, request_id: &str, target: &UpstreamTarget)
    -> Box<dyn StreamConverter>;

    /// 解析上游非 2xx 错误体
    fn parse_error(&self, status: u16, body: &[u8]) -> ProviderError {
        parse_openai_error(status, body)
    }

    /// 发起上游请求；非 2xx 时读取错误体并转换为 `ProviderError`
    async fn do_request(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget,
        body: &Value,
    ) -> ProviderResult<reqwest::Response> {
        let url = self.build_url(target)?;
        let headers = self.build_headers(target)?;
        let response = client.post(url).headers(headers).json(body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let bytes = response.bytes().await?;
        Err(self.parse_error(status.as_u16(), &bytes))
    }
}

/// 构造 JSON 请求头
pub fn json_headers<'a, I>(pairs: I) -> ProviderResult<HeaderMap>
where
    I: IntoIterator<Item = (&'static str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value).map_err(|e| {
            ProviderError::ConfigurationError(format!("invalid header value for {name}: {e}"))
        })?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

/// 解析 OpenAI 风格错误体 `{error:{message,type,code}}`
pub fn parse_openai_error(status: u16, body: &[u8]) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let message = error
        .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
        .map(ToString::to_string)
        .unwrap_or_else(|| truncated_body(body));
    let error_type = error
        .and_then(|e| e.get("type").and_then(Value::as_str))
        .unwrap_or("upstream_error");

    ProviderError::api(status, error_type, message)
}

/// 错误信息中最多保留的上游原文长度
const MAX_ERROR_BODY_CHARS: usize = 512;

pub fn truncated_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty response body".to_string();
    }
    text.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
