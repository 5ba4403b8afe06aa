//! # Gemini 适配器
//!
//! OpenAI Chat Completions 与 Gemini `generateContent` 协议互转。

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::claude::parse_data_url;
use super::sse::{SseEvent, StreamFrame};
use super::tokenizer;
use super::traits::{ProviderAdapter, StreamConverter, StreamSummary, UpstreamTarget, json_headers};
use super::types::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, ContentPart, ConvertedResponse,
    Delta, Message, MessageContent, ProviderError, ProviderResult, RelayMode, RelayRequest, Role,
    ToolCall, Usage, completion_id, finish_reason, unix_timestamp,
};
use crate::channel::VendorType;
use crate::config::GeminiSettings;
use crate::logging::{LogComponent, LogStage};
use crate::ldebug;

const SAFETY_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// 特殊工具名
const GOOGLE_SEARCH: &str = "googleSearch";
const CODE_EXECUTION: &str = "codeExecution";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<SafetySetting>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// 思考片段标记
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponsePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_code: Option<ExecutableCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution_result: Option<CodeExecutionResult>,
}

impl GeminiPart {
    pub fn text<T: Into<String>>(text: T) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponsePart {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableCode {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_search: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_declarations: Option<Vec<FunctionDeclaration>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: GeminiContent,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
    #[serde(default)]
    pub thoughts_token_count: u32,
    #[serde(default)]
    pub cached_content_token_count: u32,
}

impl UsageMetadata {
    pub const fn to_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count,
            cached_tokens: self.cached_content_token_count,
            reasoning_tokens: self.thoughts_token_count,
        }
    }
}

/// Gemini 结束原因转换
pub fn finish_reason_to_openai(reason: &str) -> &'static str {
    match reason {
        "STOP" => finish_reason::STOP,
        "MAX_TOKENS" => finish_reason::LENGTH,
        _ => finish_reason::CONTENT_FILTER,
    }
}

/// Gemini 适配器
pub struct GeminiAdapter {
    settings: GeminiSettings,
}

impl GeminiAdapter {
    pub const fn new(settings: GeminiSettings) -> Self {
        Self { settings }
    }

    fn api_version<'a>(&'a self, target: &'a UpstreamTarget) -> &'a str {
        target
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.settings.default_api_version)
    }

    /// 转换为 generateContent 请求
    pub fn convert_chat(&self, request_id: &str, req: &ChatRequest) -> ProviderResult<GeminiRequest> {
        let mut generation_config = GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_output_tokens: req.max_tokens.filter(|m| *m > 0),
            stop_sequences: req.stop.as_ref().map(super::types::StopSequences::to_vec),
            thinking_config: req
                .thinking
                .as_ref()
                .and_then(|t| t.budget_tokens)
                .map(|thinking_budget| ThinkingConfig { thinking_budget }),
            ..GenerationConfig::default()
        };
        apply_response_format(req, &mut generation_config);

        let (system_instruction, contents) = convert_messages(&req.messages)?;
        let tools = convert_tools(req);
        ldebug!(
            request_id,
            LogStage::RequestModify,
            LogComponent::GeminiAdapter,
            "convert_request",
            "Converted chat request to Gemini format",
            contents = contents.len(),
            tools = tools.len()
        );

        Ok(GeminiRequest {
            contents,
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: (*category).to_string(),
                    threshold: self.settings.safety_setting.clone(),
                })
                .collect(),
            tools,
            system_instruction,
            generation_config,
        })
    }
}

fn apply_response_format(req: &ChatRequest, config: &mut GenerationConfig) {
    let Some(format) = req.extra.get("response_format") else {
        return;
    };
    match format.get("type").and_then(Value::as_str) {
        Some("json_object") => config.response_mime_type = Some("application/json".to_string()),
        Some("json_schema") => {
            config.response_mime_type = Some("application/json".to_string());
            config.response_schema = format.pointer("/json_schema/schema").cloned();
        }
        _ => {}
    }
}

/// 参数 `properties` 为空时不下发 parameters
fn function_parameters(parameters: Option<&Value>) -> Option<Value> {
    let parameters = parameters?;
    let empty = parameters
        .get("properties")
        .and_then(Value::as_object)
        .is_none_or(Map::is_empty);
    (!empty).then(|| parameters.clone())
}

fn convert_tools(req: &ChatRequest) -> Vec<GeminiTool> {
    let Some(tools) = req.tools.as_ref().filter(|t| !t.is_empty()) else {
        return Vec::new();
    };

    let mut code_execution = false;
    let mut google_search = false;
    let mut declarations = Vec::new();
    for tool in tools {
        match tool.function.name.as_str() {
            CODE_EXECUTION => code_execution = true,
            GOOGLE_SEARCH => google_search = true,
            _ => declarations.push(FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: function_parameters(tool.function.parameters.as_ref()),
            }),
        }
    }

    let mut converted = Vec::new();
    if code_execution {
        converted.push(GeminiTool {
            code_execution: Some(json!({})),
            ..GeminiTool::default()
        });
    }
    if google_search {
        converted.push(GeminiTool {
            google_search: Some(json!({})),
            ..GeminiTool::default()
        });
    }
    if !declarations.is_empty() {
        converted.push(GeminiTool {
            function_declarations: Some(declarations),
            ..GeminiTool::default()
        });
    }
    converted
}

/// 拆出 system_instruction 并转换其余消息
pub fn convert_messages(
    messages: &[Message],
) -> ProviderResult<(Option<GeminiContent>, Vec<GeminiContent>)> {
    let mut system_texts = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();
    // tool_call_id -> 函数名
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in messages {
        match message.role {
            Role::System => system_texts.push(message.text_content()),
            Role::Tool => {
                let name = message
                    .name
                    .clone()
                    .or_else(|| {
                        message
                            .tool_call_id
                            .as_ref()
                            .and_then(|id| call_names.get(id).cloned())
                    })
                    .unwrap_or_default();
                let text = message.text_content();
                let content = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                let part = GeminiPart {
                    function_response: Some(FunctionResponsePart {
                        name: name.clone(),
                        response: json!({"name": name, "content": content}),
                    }),
                    ..GeminiPart::default()
                };

                if contents.last().is_none_or(|last| last.role == "model") {
                    contents.push(GeminiContent {
                        role: "user".to_string(),
                        parts: Vec::new(),
                    });
                }
                if let Some(last) = contents.last_mut() {
                    last.parts.push(part);
                }
            }
            Role::User | Role::Assistant => {
                let mut parts = Vec::new();
                for part in message.content.iter().flat_map(MessageContent::to_parts) {
                    if let Some(converted) = convert_part(part)? {
                        parts.push(converted);
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    let args: Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
                        ProviderError::InvalidRequest(format!(
                            "tool call arguments for {} are not valid JSON: {e}",
                            call.function.name
                        ))
                    })?;
                    if !call.id.is_empty() {
                        call_names.insert(call.id.clone(), call.function.name.clone());
                    }
                    parts.push(GeminiPart {
                        function_call: Some(FunctionCallPart {
                            name: call.function.name.clone(),
                            args,
                        }),
                        ..GeminiPart::default()
                    });
                }
                let role = if message.role == Role::Assistant { "model" } else { "user" };
                contents.push(GeminiContent {
                    role: role.to_string(),
                    parts,
                });
            }
        }
    }

    // 多条系统消息合并为一个文本块
    let system = (!system_texts.is_empty()).then(|| GeminiContent {
        role: String::new(),
        parts: vec![GeminiPart::text(system_texts.join("\n"))],
    });
    Ok((system, contents))
}

fn convert_part(part: ContentPart) -> ProviderResult<Option<GeminiPart>> {
    let converted = match part {
        ContentPart::Text { text } if text.is_empty() => return Ok(None),
        ContentPart::Text { text } => GeminiPart::text(text),
        ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
            Some((mime_type, data)) => GeminiPart {
                inline_data: Some(InlineData {
                    mime_type: mime_type.to_string(),
                    data: data.to_string(),
                }),
                ..GeminiPart::default()
            },
            None => GeminiPart {
                file_data: Some(FileData {
                    mime_type: guess_image_mime(&image_url.url).to_string(),
                    file_uri: image_url.url,
                }),
                ..GeminiPart::default()
            },
        },
        ContentPart::InputAudio { input_audio } => GeminiPart {
            inline_data: Some(InlineData {
                mime_type: format!("audio/{}", input_audio.format),
                data: input_audio.data,
            }),
            ..GeminiPart::default()
        },
    };
    Ok(Some(converted))
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or_default().to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// 单个候选转换结果
struct CandidateOutput {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
}

fn collect_parts(parts: &[GeminiPart]) -> CandidateOutput {
    let mut texts: Vec<String> = Vec::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(call) = &part.function_call {
            tool_calls.push(ToolCall::function(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                call.name.clone(),
                call.args.to_string(),
            ));
        } else if let Some(text) = &part.text {
            if part.thought {
                reasoning.push_str(text);
            } else if text != "\n" {
                texts.push(text.clone());
            }
        } else if let Some(code) = &part.executable_code {
            texts.push(format!("```{}\n{}\n```", code.language.to_lowercase(), code.code));
        } else if let Some(result) = &part.code_execution_result {
            texts.push(format!("```output\n{}\n```", result.output));
        }
    }
    CandidateOutput {
        text: texts.join("\n"),
        reasoning,
        tool_calls,
    }
}

fn candidate_finish(candidate: &Candidate, has_tool_calls: bool) -> Option<String> {
    if has_tool_calls {
        return Some(finish_reason::TOOL_CALLS.to_string());
    }
    candidate
        .finish_reason
        .as_deref()
        .map(|r| finish_reason_to_openai(r).to_string())
}

fn response_from_gemini(resp: GeminiResponse, model: &str) -> ProviderResult<(ChatResponse, Usage)> {
    if resp.candidates.is_empty() {
        return Err(ProviderError::EmptyCandidates);
    }

    let choices = resp
        .candidates
        .iter()
        .map(|candidate| {
            let output = collect_parts(&candidate.content.parts);
            let has_tool_calls = !output.tool_calls.is_empty();
            Choice {
                index: candidate.index,
                message: Message {
                    role: Role::Assistant,
                    content: Some(MessageContent::Text(output.text)),
                    tool_calls: has_tool_calls.then_some(output.tool_calls),
                    reasoning_content: (!output.reasoning.is_empty()).then_some(output.reasoning),
                    ..Message::default()
                },
                finish_reason: candidate_finish(candidate, has_tool_calls),
            }
        })
        .collect();

    let usage = resp.usage_metadata.unwrap_or_default().to_usage();
    let response = ChatResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        choices,
        usage,
    };
    Ok((response, usage))
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn vendor(&self) -> VendorType {
        VendorType::Gemini
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn build_url(&self, target: &UpstreamTarget) -> ProviderResult<String> {
        let action = if target.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{}/{}/models/{}:{action}",
            target.base_url,
            self.api_version(target),
            target.upstream_model
        ))
    }

    fn build_headers(&self, target: &UpstreamTarget) -> ProviderResult<HeaderMap> {
        json_headers([("x-goog-api-key", target.api_key.as_str())])
    }

    fn convert_request(
        &self,
        request_id: &str,
        request: &RelayRequest,
        _target: &UpstreamTarget,
    ) -> ProviderResult<Value> {
        let RelayRequest::Chat(chat) = request else {
            return Err(ProviderError::UnsupportedOperation(format!(
                "gemini channel does not support {}",
                request.mode().as_str()
            )));
        };
        Ok(serde_json::to_value(self.convert_chat(request_id, chat)?)?)
    }

    fn convert_response(
        &self,
        _request_id: &str,
        body: &[u8],
        target: &UpstreamTarget,
    ) -> ProviderResult<ConvertedResponse> {
        let resp: GeminiResponse = serde_json::from_slice(body)
            .map_err(|e| ProviderError::ResponseParseError(e.to_string()))?;
        let (response, usage) = response_from_gemini(resp, &target.upstream_model)?;
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
        Box::new(GeminiStreamConverter::new(target))
    }
}

/// Gemini 流式事件转换器
pub struct GeminiStreamConverter {
    id: String,
    created: i64,
    model: String,
    prompt_estimate: u32,
    usage: Usage,
    text: String,
}

impl GeminiStreamConverter {
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

impl StreamConverter for GeminiStreamConverter {
    fn on_event(&mut self, event: &SseEvent) -> ProviderResult<Vec<StreamFrame>> {
        let Some(resp) = event.json::<GeminiResponse>()? else {
            return Ok(Vec::new());
        };
        if let Some(metadata) = resp.usage_metadata {
            self.usage = metadata.to_usage();
        }

        let mut choices = Vec::new();
        let mut stopped = false;
        for candidate in &resp.candidates {
            let output = collect_parts(&candidate.content.parts);
            let has_tool_calls = !output.tool_calls.is_empty();
            let mut finish = candidate_finish(candidate, has_tool_calls);
            // STOP 单独作为结束块发送
            if finish.as_deref() == Some(finish_reason::STOP) {
                finish = None;
                stopped = true;
            }
            self.text.push_str(&output.text);

            let tool_calls = has_tool_calls.then(|| {
                output
                    .tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut call)| {
                        call.index = u32::try_from(i).ok();
                        call
                    })
                    .collect()
            });
            choices.push(ChunkChoice {
                index: candidate.index,
                delta: Delta {
                    role: Some(Role::Assistant),
                    content: (!output.text.is_empty()).then_some(output.text),
                    reasoning_content: (!output.reasoning.is_empty()).then_some(output.reasoning),
                    tool_calls,
                },
                finish_reason: finish,
            });
        }

        let mut frames = Vec::new();
        if !choices.is_empty() {
            frames.push(StreamFrame::chunk(ChatChunk::new(
                &self.id,
                self.created,
                &self.model,
                choices,
            )));
        }
        if stopped {
            frames.push(StreamFrame::chunk(ChatChunk::new(
                &self.id,
                self.created,
                &self.model,
                vec![ChunkChoice {
                    index: 0,
                    delta: Delta::default(),
                    finish_reason: Some(finish_reason::STOP.to_string()),
                }],
            )));
        }
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
