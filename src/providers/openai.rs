//! # OpenAI 兼容适配器
//!
//! OpenAI 与火山引擎（Ark）均为 OpenAI 协议，请求体基本原样透传，
//! 只在地址、流式用量与思考参数上有差异。

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

use super::sse::{SseEvent, StreamFrame};
use super::tokenizer;
use super::traits::{ProviderAdapter, StreamConverter, StreamSummary, UpstreamTarget, json_headers};
use super::types::{
    ConvertedResponse, ProviderError, ProviderResult, RelayMode, RelayRequest, Usage,
    completion_id, unix_timestamp,
};
use crate::channel::VendorType;
use crate::logging::{LogComponent, LogStage};
use crate::ldebug;

/// OpenAI 协议适配器
pub struct OpenAiAdapter {
    vendor: VendorType,
}

impl OpenAiAdapter {
    pub const fn openai() -> Self {
        Self {
            vendor: VendorType::OpenAi,
        }
    }

    pub const fn volcengine() -> Self {
        Self {
            vendor: VendorType::VolcEngine,
        }
    }

    const fn is_volcengine(&self) -> bool {
        matches!(self.vendor, VendorType::VolcEngine)
    }

    fn volcengine_path(target: &UpstreamTarget) -> ProviderResult<&'static str> {
        match target.mode {
            RelayMode::ChatCompletions if target.upstream_model.starts_with("bot") => {
                Ok("/api/v3/bots/chat/completions")
            }
            RelayMode::ChatCompletions => Ok("/api/v3/chat/completions"),
            RelayMode::Embeddings => Ok("/api/v3/embeddings"),
            other => Err(ProviderError::UnsupportedOperation(format!(
                "volcengine channel does not support {}",
                other.as_str()
            ))),
        }
    }
}

/// 流式请求强制上游返回用量
fn force_include_usage(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
}

/// 非流式响应中的补全文本，用于缺失用量时估算
fn response_text(body: &Value) -> String {
    body.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| {
                    choice
                        .pointer("/message/content")
                        .or_else(|| choice.get("text"))
                        .and_then(Value::as_str)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage(body: &Value) -> Usage {
    body.get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default()
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn vendor(&self) -> VendorType {
        self.vendor
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        if self.is_volcengine() {
            matches!(mode, RelayMode::ChatCompletions | RelayMode::Embeddings)
        } else {
            true
        }
    }

    fn build_url(&self, target: &UpstreamTarget) -> ProviderResult<String> {
        let path = if self.is_volcengine() {
            Self::volcengine_path(target)?
        } else {
            target.mode.path()
        };
        Ok(format!("{}{path}", target.base_url))
    }

    fn build_headers(&self, target: &UpstreamTarget) -> ProviderResult<HeaderMap> {
        let bearer = format!("Bearer {}", target.api_key);
        json_headers([("authorization", bearer.as_str())])
    }

    fn convert_request(
        &self,
        request_id: &str,
        request: &RelayRequest,
        target: &UpstreamTarget,
    ) -> ProviderResult<Value> {
        let mut body = match request {
            RelayRequest::Chat(chat) => serde_json::to_value(chat)?,
            RelayRequest::Passthrough { body, .. } => body.clone(),
        };
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(target.upstream_model.clone()),
            );
        }
        if target.stream {
            force_include_usage(&mut body);
        }
        if self.is_volcengine()
            && let Some(thinking) = body.get_mut("thinking")
        {
            let kind = thinking.get("type").cloned().unwrap_or(Value::Null);
            *thinking = json!({"type": kind});
            ldebug!(
                request_id,
                LogStage::RequestModify,
                LogComponent::OpenAiAdapter,
                "trim_thinking",
                "Volcengine thinking reduced to type only"
            );
        }
        Ok(body)
    }

    fn convert_response(
        &self,
        request_id: &str,
        body: &[u8],
        target: &UpstreamTarget,
    ) -> ProviderResult<ConvertedResponse> {
        let mut value: Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::ResponseParseError(e.to_string()))?;
        if let Some(err) = error_object(&value) {
            return Err(err);
        }

        let reported = parse_usage(&value);
        let usage = tokenizer::fill_usage(
            &target.upstream_model,
            target.prompt_tokens,
            reported,
            &response_text(&value),
        );
        if usage != reported {
            ldebug!(
                request_id,
                LogStage::Response,
                LogComponent::OpenAiAdapter,
                "estimate_usage",
                "Upstream usage incomplete, filled with local estimate",
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens
            );
            if let Some(obj) = value.as_object_mut() {
                obj.insert("usage".to_string(), serde_json::to_value(usage)?);
            }
        }
        Ok(ConvertedResponse { body: value, usage })
    }

    fn stream_converter(
        &self,
        _request_id: &str,
        target: &UpstreamTarget,
    ) -> Box<dyn StreamConverter> {
        Box::new(OpenAiStreamConverter::new(target))
    }
}

/// 逐块透传，同时记录用量与补全文本
pub struct OpenAiStreamConverter {
    id: String,
    created: i64,
    model: String,
    prompt_estimate: u32,
    usage: Usage,
    text: String,
}

impl OpenAiStreamConverter {
    pub fn new(target: &UpstreamTarget) -> Self {
        Self {
            id: completion_id(),
            created: unix_timestamp(),
            model: target.upstream_model.clone(),
            prompt_estimate: target.prompt_tokens,
            usage: Usage::default(),
            text: String::new(),
        }
    }
}

/// 2xx 响应体或流事件里携带的错误对象
fn error_object(value: &Value) -> Option<ProviderError> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream returned an error object");
    Some(ProviderError::api(500, "upstream_error", message))
}

impl StreamConverter for OpenAiStreamConverter {
    fn on_event(&mut self, event: &SseEvent) -> ProviderResult<Vec<StreamFrame>> {
        let Some(chunk) = event.json::<Value>()? else {
            return Ok(Vec::new());
        };
        if let Some(err) = error_object(&chunk) {
            return Err(err);
        }

        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            id.clone_into(&mut self.id);
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_i64) {
            self.created = created;
        }
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            model.clone_into(&mut self.model);
        }
        let usage = parse_usage(&chunk);
        if !usage.is_zero() {
            self.usage = usage;
        }

        let choices = chunk.get("choices").and_then(Value::as_array);
        // 仅含用量的尾块由中继层统一补发
        if choices.is_none_or(Vec::is_empty) {
            return Ok(Vec::new());
        }
        for choice in choices.into_iter().flatten() {
            if let Some(text) = choice
                .pointer("/delta/content")
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str)
            {
                self.text.push_str(text);
            }
        }
        Ok(vec![StreamFrame::Raw(event.data.trim().to_string())])
    }

    fn finish(&mut self) -> StreamSummary {
        StreamSummary {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            usage: tokenizer::fill_usage(&self.model, self.prompt_estimate, self.usage, &self.text),
        }
    }
}
