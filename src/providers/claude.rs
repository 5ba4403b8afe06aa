//! # Claude 适配器
//!
//! OpenAI Chat Completions 与 Claude Messages 协议互转，
//! 兼容 `claude-2` / `claude-instant` 的 `\n\nHuman:` 补全协议。

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::sse::{SseEvent, StreamFrame};
use super::tokenizer;
use super::traits::{
    ProviderAdapter, StreamConverter, StreamSummary, UpstreamTarget, json_headers,
    truncated_body,
};
use super::types::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, ContentPart, ConvertedResponse,
    Delta, Message, MessageContent, ProviderError, ProviderResult, RelayMode, RelayRequest, Role,
    ToolCall, Usage, completion_id, unix_timestamp,
};
use crate::channel::VendorType;
use crate::config::ClaudeSettings;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// 思考模式下 max_tokens 下限
pub const THINKING_MIN_MAX_TOKENS: u32 = 1280;
/// 思考预算下限
pub const THINKING_MIN_BUDGET: u32 = 1024;
const THINKING_SUFFIX: &str = "-thinking";
/// 补全协议默认采样长度
const LEGACY_MAX_TOKENS_TO_SAMPLE: u32 = 4096;
/// 空内容占位
const PLACEHOLDER: &str = "...";

/// Claude 结束原因转换为 OpenAI 结束原因
pub fn stop_reason_to_openai(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        other => other.to_string(),
    }
}

/// 是否使用旧版补全协议
pub fn is_legacy_model(model: &str) -> bool {
    model.starts_with("claude-2") || model.starts_with("claude-instant")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ClaudeMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_to_sample: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ClaudeThinking>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeThinking {
    #[serde(rename = "type")]
    pub kind: String,
    pub budget_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
}

impl ClaudeUsage {
    /// 提示词 token 包含缓存读写部分，缓存读取单独计入 `cached_tokens`
    pub const fn to_usage(self) -> Usage {
        Usage {
            prompt_tokens: self
                .input_tokens
                .saturating_add(self.cache_read_input_tokens)
                .saturating_add(self.cache_creation_input_tokens),
            completion_tokens: self.output_tokens,
            cached_tokens: self.cache_read_input_tokens,
            reasoning_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<ClaudeBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: ClaudeUsage,
    /// 补全协议的输出
    #[serde(default)]
    pub completion: Option<String>,
    #[serde(default)]
    pub error: Option<ClaudeErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeStreamEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: Option<ClaudeResponse>,
    #[serde(default)]
    pub content_block: Option<ClaudeBlock>,
    #[serde(default)]
    pub delta: Option<ClaudeDelta>,
    #[serde(default)]
    pub usage: Option<ClaudeUsage>,
    #[serde(default)]
    pub completion: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub error: Option<ClaudeErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeDelta {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Claude 适配器
pub struct ClaudeAdapter {
    settings: ClaudeSettings,
}

impl ClaudeAdapter {
    pub const fn new(settings: ClaudeSettings) -> Self {
        Self { settings }
    }

    /// 转换为 Messages 协议请求
    pub fn convert_chat(&self, request_id: &str, req: &ChatRequest) -> ProviderResult<ClaudeRequest> {
        let mut claude = ClaudeRequest {
            model: req.model.clone(),
            max_tokens: Some(
                req.max_tokens
                    .filter(|m| *m > 0)
                    .unwrap_or(self.settings.default_max_tokens),
            ),
            stop_sequences: req.stop.as_ref().map(super::types::StopSequences::to_vec),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stream: req.stream,
            tools: convert_tools(req),
            tool_choice: req.tool_choice.as_ref().and_then(convert_tool_choice),
            ..ClaudeRequest::default()
        };

        self.apply_thinking(request_id, req, &mut claude);

        let (system, messages) = convert_messages(request_id, &req.messages)?;
        claude.system = system;
        claude.messages = messages;
        Ok(claude)
    }

    fn apply_thinking(&self, request_id: &str, req: &ChatRequest, claude: &mut ClaudeRequest) {
        let suffixed = self.settings.thinking_adapter_enabled && req.model.ends_with(THINKING_SUFFIX);
        let requested = req.thinking.as_ref().filter(|t| t.kind == "enabled");
        if !suffixed && requested.is_none() {
            return;
        }

        let mut max_tokens = claude.max_tokens.unwrap_or(self.settings.default_max_tokens);
        if max_tokens < THINKING_MIN_MAX_TOKENS {
            ldebug!(
                request_id,
                LogStage::RequestModify,
                LogComponent::ClaudeAdapter,
                "raise_max_tokens",
                "max_tokens raised to thinking minimum",
                requested = max_tokens,
                applied = THINKING_MIN_MAX_TOKENS
            );
            max_tokens = THINKING_MIN_MAX_TOKENS;
        }

        let budget = match requested.and_then(|t| t.budget_tokens) {
            Some(budget) => budget,
            None => (f64::from(max_tokens) * self.settings.thinking_budget_percentage) as u32,
        };
        let budget = if budget < THINKING_MIN_BUDGET {
            linfo!(
                request_id,
                LogStage::RequestModify,
                LogComponent::ClaudeAdapter,
                "raise_thinking_budget",
                "thinking budget raised to minimum",
                requested = budget,
                applied = THINKING_MIN_BUDGET
            );
            THINKING_MIN_BUDGET
        } else {
            budget
        };

        claude.max_tokens = Some(max_tokens);
        claude.thinking = Some(ClaudeThinking {
            kind: "enabled".to_string(),
            budget_tokens: budget,
        });
        claude.top_p = None;
        claude.temperature = Some(1.0);
        if suffixed {
            claude.model = req.model.trim_end_matches(THINKING_SUFFIX).to_string();
        }
    }

    /// 转换为补全协议请求
    pub fn convert_legacy(&self, req: &ChatRequest) -> ClaudeRequest {
        let mut prompt = String::new();
        for message in &req.messages {
            match message.role {
                Role::User => {
                    prompt.push_str("\n\nHuman: ");
                    prompt.push_str(&message.text_content());
                }
                Role::Assistant => {
                    prompt.push_str("\n\nAssistant: ");
                    prompt.push_str(&message.text_content());
                }
                Role::System if prompt.is_empty() => prompt = message.text_content(),
                Role::System | Role::Tool => {}
            }
        }
        prompt.push_str("\n\nAssistant:");

        ClaudeRequest {
            model: req.model.clone(),
            prompt: Some(prompt),
            max_tokens_to_sample: Some(
                req.max_tokens
                    .filter(|m| *m > 0)
                    .unwrap_or(LEGACY_MAX_TOKENS_TO_SAMPLE),
            ),
            stop_sequences: req.stop.as_ref().map(super::types::StopSequences::to_vec),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stream: req.stream,
            ..ClaudeRequest::default()
        }
    }
}

fn convert_tools(req: &ChatRequest) -> Option<Vec<ClaudeTool>> {
    let tools = req.tools.as_ref().filter(|t| !t.is_empty())?;
    Some(
        tools
            .iter()
            .map(|tool| ClaudeTool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect(),
    )
}

fn convert_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => None,
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    }
}

/// 合并相邻同角色纯文本消息并补齐空内容
fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    let mut normalized: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let mut current = Message {
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            ..Message::default()
        };

        if let Some(last) = normalized.last()
            && last.role == current.role
            && current.role != Role::Tool
            && last.is_plain_text()
            && current.is_plain_text()
            && !last.has_tool_calls()
            && !current.has_tool_calls()
        {
            let merged = format!("{} {}", last.text_content(), current.text_content());
            current.content = Some(MessageContent::Text(merged.trim_matches('"').to_string()));
            normalized.pop();
        }

        let empty = match &current.content {
            None => true,
            Some(MessageContent::Text(text)) => text.is_empty(),
            Some(MessageContent::Parts(parts)) => parts.is_empty(),
        };
        if empty && !current.has_tool_calls() {
            current.content = Some(MessageContent::Text(PLACEHOLDER.to_string()));
        }
        normalized.push(current);
    }
    normalized
}

/// 拆出 system 并转换其余消息
pub fn convert_messages(
    request_id: &str,
    messages: &[Message],
) -> ProviderResult<(Option<String>, Vec<ClaudeMessage>)> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut converted: Vec<ClaudeMessage> = Vec::new();

    for message in normalize_messages(messages) {
        if message.role == Role::System {
            system_parts.push(message.text_content());
            continue;
        }

        if converted.is_empty() && message.role != Role::User {
            converted.push(ClaudeMessage {
                role: "user".to_string(),
                content: ClaudeContent::Blocks(vec![ClaudeBlock::Text {
                    text: PLACEHOLDER.to_string(),
                }]),
            });
        }

        if message.role == Role::Tool {
            let result = ClaudeBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.text_content(),
            };
            match converted.last_mut() {
                Some(last) if last.role == "user" => {
                    let blocks = match std::mem::replace(
                        &mut last.content,
                        ClaudeContent::Blocks(Vec::new()),
                    ) {
                        ClaudeContent::Text(text) => vec![ClaudeBlock::Text { text }],
                        ClaudeContent::Blocks(blocks) => blocks,
                    };
                    let mut blocks = blocks;
                    blocks.push(result);
                    last.content = ClaudeContent::Blocks(blocks);
                }
                _ => converted.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Blocks(vec![result]),
                }),
            }
            continue;
        }

        let content = if message.is_plain_text() && !message.has_tool_calls() {
            ClaudeContent::Text(message.text_content())
        } else {
            let mut blocks = Vec::new();
            for part in message.content.iter().flat_map(MessageContent::to_parts) {
                blocks.push(convert_part(part)?);
            }
            for call in message.tool_calls.iter().flatten() {
                match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(input) if input.is_object() => blocks.push(ClaudeBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    }),
                    _ => lwarn!(
                        request_id,
                        LogStage::RequestModify,
                        LogComponent::ClaudeAdapter,
                        "skip_tool_call",
                        "tool call arguments are not a JSON object, skipped",
                        tool = %call.function.name
                    ),
                }
            }
            ClaudeContent::Blocks(blocks)
        };

        converted.push(ClaudeMessage {
            role: message.role.as_str().to_string(),
            content,
        });
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n"));
    Ok((system, converted))
}

fn convert_part(part: ContentPart) -> ProviderResult<ClaudeBlock> {
    match part {
        ContentPart::Text { text } => Ok(ClaudeBlock::Text { text }),
        ContentPart::ImageUrl { image_url } => {
            let source = match parse_data_url(&image_url.url) {
                Some((media_type, data)) => ImageSource::Base64 {
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                },
                None if image_url.url.starts_with("http") => ImageSource::Url {
                    url: image_url.url,
                },
                None => {
                    return Err(ProviderError::InvalidRequest(
                        "image_url must be a data URL or an http(s) URL".to_string(),
                    ));
                }
            };
            Ok(ClaudeBlock::Image { source })
        }
        ContentPart::InputAudio { .. } => Err(ProviderError::UnsupportedOperation(
            "claude does not accept audio input".to_string(),
        )),
    }
}

/// 解析 `data:{mime};base64,{data}`
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

fn response_from_claude(resp: ClaudeResponse, model: &str) -> (ChatResponse, Usage) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block {
            ClaudeBlock::Text { text: t } => text.push_str(&t),
            ClaudeBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ClaudeBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::function(id, name, input.to_string()));
            }
            _ => {}
        }
    }

    let message = Message {
        role: Role::Assistant,
        content: Some(MessageContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        ..Message::default()
    };
    let usage = resp.usage.to_usage();
    let response = ChatResponse {
        id: if resp.id.is_empty() { completion_id() } else { resp.id },
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: if resp.model.is_empty() {
            model.to_string()
        } else {
            resp.model
        },
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: resp.stop_reason.as_deref().map(stop_reason_to_openai),
        }],
        usage,
    };
    (response, usage)
}

fn legacy_response(resp: &ClaudeResponse, target: &UpstreamTarget) -> (ChatResponse, Usage) {
    let text = resp
        .completion
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches(' ')
        .to_string();
    let usage = Usage::new(
        target.prompt_tokens,
        tokenizer::count_text(&target.upstream_model, &text),
    );
    let response = ChatResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: target.upstream_model.clone(),
        choices: vec![Choice {
            index: 0,
            message: Message::text(Role::Assistant, text),
            finish_reason: resp.stop_reason.as_deref().map(stop_reason_to_openai),
        }],
        usage,
    };
    (response, usage)
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn vendor(&self) -> VendorType {
        VendorType::Claude
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn build_url(&self, target: &UpstreamTarget) -> ProviderResult<String> {
        let path = if is_legacy_model(&target.upstream_model) {
            "/v1/complete"
        } else {
            "/v1/messages"
        };
        Ok(format!("{}{path}", target.base_url))
    }

    fn build_headers(&self, target: &UpstreamTarget) -> ProviderResult<HeaderMap> {
        json_headers([
            ("x-api-key", target.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ])
    }

    fn convert_request(
        &self,
        request_id: &str,
        request: &RelayRequest,
        target: &UpstreamTarget,
    ) -> ProviderResult<Value> {
        let RelayRequest::Chat(chat) = request else {
            return Err(ProviderError::UnsupportedOperation(format!(
                "claude channel does not support {}",
                request.mode().as_str()
            )));
        };
        let claude = if is_legacy_model(&target.upstream_model) {
            self.convert_legacy(chat)
        } else {
            self.convert_chat(request_id, chat)?
        };
        Ok(serde_json::to_value(claude)?)
    }

    fn convert_response(
        &self,
        _request_id: &str,
        body: &[u8],
        target: &UpstreamTarget,
    ) -> ProviderResult<ConvertedResponse> {
        let resp: ClaudeResponse = serde_json::from_slice(body)
            .map_err(|e| ProviderError::ResponseParseError(e.to_string()))?;
        if let Some(error) = resp.error.as_ref().filter(|e| !e.kind.is_empty()) {
            return Err(ProviderError::api(500, error.kind.clone(), error.message.clone()));
        }

        let (response, usage) = if is_legacy_model(&target.upstream_model) {
            legacy_response(&resp, target)
        } else {
            response_from_claude(resp, &target.upstream_model)
        };
        Ok(ConvertedResponse {
            body: serde_json::to_value(response)?,
            usage,
        })
    }

    fn stream_converter(
        &self,
        _request_id: &str,
        target: &UpstreamTarget,
    ) -> Box<dyn StreamConverter> {
        Box::new(ClaudeStreamConverter::new(target))
    }

    fn parse_error(&self, status: u16, body: &[u8]) -> ProviderError {
        match serde_json::from_slice::<ClaudeResponse>(body) {
            Ok(ClaudeResponse {
                error: Some(error), ..
            }) => ProviderError::api(status, error.kind, error.message),
            _ => ProviderError::api(status, "upstream_error", truncated_body(body)),
        }
    }
}

/// Claude 流式事件转换器
pub struct ClaudeStreamConverter {
    id: String,
    created: i64,
    model: String,
    legacy: bool,
    prompt_estimate: u32,
    usage: Usage,
    text: String,
    /// 已开始的工具调用个数
    tool_calls: u32,
}

impl ClaudeStreamConverter {
    pub fn new(target: &UpstreamTarget) -> Self {
        Self {
            id: completion_id(),
            created: unix_timestamp(),
            model: target.upstream_model.clone(),
            legacy: is_legacy_model(&target.upstream_model),
            prompt_estimate: target.prompt_tokens,
            usage: Usage::default(),
            text: String::new(),
            tool_calls: 0,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> StreamFrame {
        StreamFrame::chunk(ChatChunk::new(
            &self.id,
            self.created,
            &self.model,
            vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        ))
    }

    fn on_legacy(&mut self, event: &ClaudeStreamEvent) -> Vec<StreamFrame> {
        let text = event.completion.clone().unwrap_or_default();
        self.text.push_str(&text);
        let finish = event.stop_reason.as_deref().map(stop_reason_to_openai);
        let delta = Delta {
            content: Some(text),
            ..Delta::default()
        };
        vec![self.chunk(delta, finish)]
    }
}

impl StreamConverter for ClaudeStreamConverter {
    fn on_event(&mut self, event: &SseEvent) -> ProviderResult<Vec<StreamFrame>> {
        let Some(event) = event.json::<ClaudeStreamEvent>()? else {
            return Ok(Vec::new());
        };
        if let Some(error) = event.error.as_ref() {
            return Err(ProviderError::api(500, error.kind.clone(), error.message.clone()));
        }
        if self.legacy {
            return Ok(self.on_legacy(&event));
        }

        let frames = match event.kind.as_str() {
            "message_start" => {
                if let Some(message) = event.message {
                    if !message.id.is_empty() {
                        self.id = message.id;
                    }
                    if !message.model.is_empty() {
                        self.model = message.model;
                    }
                    let start = message.usage.to_usage();
                    self.usage.prompt_tokens = start.prompt_tokens;
                    self.usage.cached_tokens = start.cached_tokens;
                }
                vec![self.chunk(
                    Delta {
                        role: Some(Role::Assistant),
                        content: Some(String::new()),
                        ..Delta::default()
                    },
                    None,
                )]
            }
            "content_block_start" => match event.content_block {
                Some(ClaudeBlock::ToolUse { id, name, .. }) => {
                    let mut call = ToolCall::function(id, name, "");
                    call.index = Some(self.tool_calls);
                    self.tool_calls += 1;
                    vec![self.chunk(
                        Delta {
                            tool_calls: Some(vec![call]),
                            ..Delta::default()
                        },
                        None,
                    )]
                }
                _ => Vec::new(),
            },
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return Ok(Vec::new());
                };
                match delta.kind.as_str() {
                    "text_delta" => {
                        let text = delta.text.unwrap_or_default();
                        self.text.push_str(&text);
                        vec![self.chunk(
                            Delta {
                                content: Some(text),
                                ..Delta::default()
                            },
                            None,
                        )]
                    }
                    "input_json_delta" => {
                        let call = ToolCall {
                            index: Some(self.tool_calls.saturating_sub(1)),
                            function: super::types::FunctionCall {
                                name: String::new(),
                                arguments: delta.partial_json.unwrap_or_default(),
                            },
                            ..ToolCall::default()
                        };
                        vec![self.chunk(
                            Delta {
                                tool_calls: Some(vec![call]),
                                ..Delta::default()
                            },
                            None,
                        )]
                    }
                    "thinking_delta" => vec![self.chunk(
                        Delta {
                            reasoning_content: delta.thinking,
                            ..Delta::default()
                        },
                        None,
                    )],
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    self.usage.completion_tokens = usage.output_tokens;
                }
                let finish = event
                    .delta
                    .and_then(|d| d.stop_reason)
                    .map(|r| stop_reason_to_openai(&r));
                vec![self.chunk(Delta::default(), finish)]
            }
            _ => Vec::new(),
        };
        Ok(frames)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{FunctionDefinition, Tool};
    use pretty_assertions::assert_eq;

    fn adapter() -> ClaudeAdapter {
        ClaudeAdapter::new(ClaudeSettings::default())
    }

    fn chat(model: &str, messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages,
            ..ChatRequest::default()
        }
    }

    fn target(model: &str) -> UpstreamTarget {
        UpstreamTarget {
            mode: RelayMode::ChatCompletions,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: "sk-ant".to_string(),
            upstream_model: model.to_string(),
            api_version: None,
            stream: false,
            prompt_tokens: 7,
        }
    }

    fn sse(data: Value) -> SseEvent {
        SseEvent {
            data: data.to_string(),
            ..SseEvent::default()
        }
    }

    #[test]
    fn stop_reasons_are_translated() {
        assert_eq!(stop_reason_to_openai("end_turn"), "stop");
        assert_eq!(stop_reason_to_openai("stop_sequence"), "stop");
        assert_eq!(stop_reason_to_openai("max_tokens"), "max_tokens");
        assert_eq!(stop_reason_to_openai("tool_use"), "tool_use");
    }

    #[test]
    fn thinking_suffix_raises_minimums() {
        let mut req = chat("claude-3-thinking", vec![Message::text(Role::User, "hi")]);
        req.max_tokens = Some(1000);
        req.top_p = Some(0.5);
        let claude = adapter().convert_chat("t", &req).unwrap();
        assert_eq!(claude.model, "claude-3");
        assert_eq!(claude.max_tokens, Some(1280));
        assert_eq!(
            claude.thinking,
            Some(ClaudeThinking {
                kind: "enabled".to_string(),
                budget_tokens: 1024
            })
        );
        assert_eq!(claude.top_p, None);
        assert_eq!(claude.temperature, Some(1.0));
    }

    #[test]
    fn explicit_budget_is_floored() {
        let mut req = chat("claude-3-7-sonnet-thinking", vec![Message::text(Role::User, "hi")]);
        req.max_tokens = Some(4000);
        req.thinking = Some(crate::providers::types::ThinkingDirective {
            kind: "enabled".to_string(),
            budget_tokens: Some(100),
        });
        let claude = adapter().convert_chat("t", &req).unwrap();
        assert_eq!(claude.max_tokens, Some(4000));
        assert_eq!(claude.thinking.unwrap().budget_tokens, 1024);
    }

    #[test]
    fn missing_max_tokens_uses_default() {
        let req = chat("claude-3-opus", vec![Message::text(Role::User, "hi")]);
        let claude = adapter().convert_chat("t", &req).unwrap();
        assert_eq!(claude.max_tokens, Some(8192));
        assert!(claude.thinking.is_none());
    }

    #[test]
    fn same_role_text_turns_are_merged() {
        let (system, messages) = convert_messages(
            "t",
            &[
                Message::text(Role::System, "be nice"),
                Message::text(Role::User, "a"),
                Message::text(Role::User, "b"),
            ],
        )
        .unwrap();
        assert_eq!(system.as_deref(), Some("be nice"));
        assert_eq!(
            messages,
            vec![ClaudeMessage {
                role: "user".to_string(),
                content: ClaudeContent::Text("a b".to_string()),
            }]
        );
    }

    #[test]
    fn first_turn_is_forced_to_user_and_empty_content_filled() {
        let (_, messages) = convert_messages(
            "t",
            &[
                Message {
                    role: Role::Assistant,
                    ..Message::default()
                },
                Message::text(Role::User, "go"),
            ],
        )
        .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(
            messages[0].content,
            ClaudeContent::Blocks(vec![ClaudeBlock::Text {
                text: "...".to_string()
            }])
        );
        assert_eq!(messages[1].content, ClaudeContent::Text("...".to_string()));
    }

    #[test]
    fn tool_calls_and_results_keep_linkage() {
        let assistant = Message {
            role: Role::Assistant,
            tool_calls: Some(vec![ToolCall::function(
                "toolu_1",
                "get_weather",
                r#"{"city":"Paris"}"#,
            )]),
            ..Message::default()
        };
        let tool = Message {
            role: Role::Tool,
            content: Some(MessageContent::Text("sunny".to_string())),
            tool_call_id: Some("toolu_1".to_string()),
            ..Message::default()
        };
        let (_, messages) = convert_messages(
            "t",
            &[Message::text(Role::User, "weather?"), assistant, tool],
        )
        .unwrap();

        assert_eq!(messages.len(), 3);
        let ClaudeContent::Blocks(blocks) = &messages[1].content else {
            panic!("assistant turn should be blocks");
        };
        assert!(blocks.contains(&ClaudeBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "get_weather".to_string(),
            input: json!({"city": "Paris"}),
        }));
        assert_eq!(messages[2].role, "user");
        assert_eq!(
            messages[2].content,
            ClaudeContent::Blocks(vec![ClaudeBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "sunny".to_string(),
            }])
        );
    }

    #[test]
    fn tool_result_joins_preceding_user_turn() {
        let tool = Message {
            role: Role::Tool,
            content: Some(MessageContent::Text("42".to_string())),
            tool_call_id: Some("call_9".to_string()),
            ..Message::default()
        };
        let (_, messages) =
            convert_messages("t", &[Message::text(Role::User, "compute"), tool]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].content,
            ClaudeContent::Blocks(vec![
                ClaudeBlock::Text {
                    text: "compute".to_string()
                },
                ClaudeBlock::ToolResult {
                    tool_use_id: "call_9".to_string(),
                    content: "42".to_string()
                },
            ])
        );
    }

    #[test]
    fn data_url_images_become_base64_sources() {
        let msg = Message {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "look".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: crate::providers::types::ImageUrl {
                        url: "data:image/png;base64,iVBOR".to_string(),
                        detail: None,
                    },
                },
            ])),
            ..Message::default()
        };
        let (_, messages) = convert_messages("t", &[msg]).unwrap();
        let ClaudeContent::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks[1],
            ClaudeBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".to_string(),
                    data: "iVBOR".to_string()
                }
            }
        );
    }

    #[test]
    fn tools_and_choice_are_mapped() {
        let mut req = chat("claude-3-opus", vec![Message::text(Role::User, "hi")]);
        req.tools = Some(vec![Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: "lookup".to_string(),
                description: Some("find".to_string()),
                parameters: None,
            },
        }]);
        req.tool_choice = Some(json!("required"));
        let claude = adapter().convert_chat("t", &req).unwrap();
        let tools = claude.tools.unwrap();
        assert_eq!(tools[0].input_schema, json!({"type": "object", "properties": {}}));
        assert_eq!(claude.tool_choice, Some(json!({"type": "any"})));
    }

    #[test]
    fn legacy_models_use_human_prompt() {
        let req = chat(
            "claude-2.1",
            vec![
                Message::text(Role::System, "sys"),
                Message::text(Role::User, "hello"),
            ],
        );
        let claude = adapter().convert_legacy(&req);
        assert_eq!(claude.prompt.as_deref(), Some("sys\n\nHuman: hello\n\nAssistant:"));
        assert_eq!(claude.max_tokens_to_sample, Some(4096));
        assert_eq!(
            adapter().build_url(&target("claude-2.1")).unwrap(),
            "https://api.anthropic.com/v1/complete"
        );
    }

    #[test]
    fn response_maps_text_tools_and_usage() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "model": "claude-3-opus",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "Hi"},
                {"type": "tool_use", "id": "toolu_2", "name": "f", "input": {"a": 1}}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 4}
        });
        let converted = adapter()
            .convert_response("t", body.to_string().as_bytes(), &target("claude-3-opus"))
            .unwrap();
        assert_eq!(converted.usage.prompt_tokens, 14);
        assert_eq!(converted.usage.cached_tokens, 4);
        assert_eq!(converted.usage.completion_tokens, 5);

        let message = &converted.body["choices"][0]["message"];
        assert_eq!(message["content"], "Hi");
        assert_eq!(message["reasoning_content"], "hmm");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "f");
        let args: Value = serde_json::from_str(
            message["tool_calls"][0]["function"]["arguments"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(args, json!({"a": 1}));
        assert_eq!(converted.body["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn error_bodies_surface_as_api_errors() {
        let body = br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match adapter().parse_error(529, body) {
            ProviderError::ApiError {
                status_code,
                error_type,
                message,
            } => {
                assert_eq!(status_code, 529);
                assert_eq!(error_type, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stream_events_become_chunks() {
        let mut converter = ClaudeStreamConverter::new(&target("claude-3-opus"));
        let start = converter
            .on_event(&sse(json!({
                "type": "message_start",
                "message": {"id": "msg_9", "model": "claude-3-opus", "usage": {"input_tokens": 11, "output_tokens": 1}}
            })))
            .unwrap();
        assert_eq!(start.len(), 1);

        let thinking = converter
            .on_event(&sse(json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "thinking_delta", "thinking": "let me see"}
            })))
            .unwrap();
        let StreamFrame::Chunk(chunk) = &thinking[0] else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.choices[0].delta.reasoning_content.as_deref(), Some("let me see"));

        for text in ["Hel", "lo"] {
            converter
                .on_event(&sse(json!({
                    "type": "content_block_delta", "index": 1,
                    "delta": {"type": "text_delta", "text": text}
                })))
                .unwrap();
        }
        let end = converter
            .on_event(&sse(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "max_tokens"},
                "usage": {"output_tokens": 3}
            })))
            .unwrap();
        let StreamFrame::Chunk(chunk) = &end[0] else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.id, "msg_9");
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("max_tokens"));

        assert!(
            converter
                .on_event(&sse(json!({"type": "message_stop"})))
                .unwrap()
                .is_empty()
        );
        let summary = converter.finish();
        assert_eq!(summary.usage, Usage::new(11, 3));
        assert_eq!(summary.id, "msg_9");
    }

    #[test]
    fn stream_tool_use_is_indexed() {
        let mut converter = ClaudeStreamConverter::new(&target("claude-3-opus"));
        let start = converter
            .on_event(&sse(json!({
                "type": "content_block_start", "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_5", "name": "calc", "input": {}}
            })))
            .unwrap();
        let StreamFrame::Chunk(chunk) = &start[0] else {
            panic!("expected chunk");
        };
        let call = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, Some(0));
        assert_eq!(call.id, "toolu_5");

        let args = converter
            .on_event(&sse(json!({
                "type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"x\":"}
            })))
            .unwrap();
        let StreamFrame::Chunk(chunk) = &args[0] else {
            panic!("expected chunk");
        };
        let call = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, Some(0));
        assert_eq!(call.function.arguments, "{\"x\":");
    }

    #[test]
    fn stream_without_usage_is_estimated() {
        let mut converter = ClaudeStreamConverter::new(&target("claude-instant-1.2"));
        converter
            .on_event(&sse(json!({"type": "completion", "completion": " Hello there", "stop_reason": null})))
            .unwrap();
        let summary = converter.finish();
        assert_eq!(summary.usage.prompt_tokens, 7);
        assert!(summary.usage.completion_tokens > 0);
    }
}
