//! # 本地 token 估算
//!
//! 预扣费需要在请求发出前得到提示词 token 数；上游未报告补全用量时，
//! 也用这里的结果估算补全 token。

use std::sync::LazyLock;

use serde_json::Value;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

use super::types::{ContentPart, Message, Usage};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 每条消息的固定开销
const TOKENS_PER_MESSAGE: u32 = 3;
/// 回复起始的固定开销
const TOKENS_PER_REPLY: u32 = 3;
/// 每张图片的估算值
const TOKENS_PER_IMAGE: u32 = 85;

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| load("cl100k_base", cl100k_base()));
static O200K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| load("o200k_base", o200k_base()));

fn load<E: std::fmt::Display>(name: &str, loaded: Result<CoreBPE, E>) -> Option<CoreBPE> {
    match loaded {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Internal,
                LogComponent::Tokenizer,
                "load_encoding_failed",
                "Tokenizer encoding unavailable, falling back to length estimate",
                encoding = name,
                error = %e
            );
            None
        }
    }
}

fn encoding_for(model: &str) -> Option<&'static CoreBPE> {
    let model = model.to_ascii_lowercase();
    let o200k = model.contains("gpt-4o")
        || model.contains("gpt-4.1")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4");
    if o200k {
        O200K.as_ref()
    } else {
        CL100K.as_ref()
    }
}

/// 文本 token 数
pub fn count_text(model: &str, text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let count = encoding_for(model).map_or_else(
        || text.chars().count().div_ceil(4),
        |bpe| bpe.encode_with_special_tokens(text).len(),
    );
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// 聊天消息 token 数
pub fn count_messages(model: &str, messages: &[Message]) -> u32 {
    let mut total = TOKENS_PER_REPLY;
    for message in messages {
        total = total
            .saturating_add(TOKENS_PER_MESSAGE)
            .saturating_add(count_text(model, message.role.as_str()));
        if let Some(content) = &message.content {
            for part in content.to_parts() {
                let tokens = match part {
                    ContentPart::Text { text } => count_text(model, &text),
                    ContentPart::ImageUrl { .. } => TOKENS_PER_IMAGE,
                    ContentPart::InputAudio { input_audio } => {
                        count_text(model, &input_audio.format)
                    }
                };
                total = total.saturating_add(tokens);
            }
        }
        if let Some(name) = &message.name {
            total = total.saturating_add(count_text(model, name));
        }
        for call in message.tool_calls.iter().flatten() {
            total = total
                .saturating_add(count_text(model, &call.function.name))
                .saturating_add(count_text(model, &call.function.arguments));
        }
    }
    total
}

/// 透传请求中 `input` / `prompt` / `query` 之类字段的 token 数
pub fn count_value(model: &str, value: &Value) -> u32 {
    match value {
        Value::String(text) => count_text(model, text),
        Value::Array(items) => items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(count_value(model, item))),
        Value::Object(map) => map
            .get("text")
            .map_or(0, |text| count_value(model, text)),
        _ => 0,
    }
}

/// 上游未报告的用量用本地估算补齐
pub fn fill_usage(model: &str, prompt_tokens: u32, reported: Usage, completion_text: &str) -> Usage {
    let mut usage = reported;
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_tokens;
    }
    if usage.completion_tokens == 0 {
        usage.completion_tokens = count_text(model, completion_text);
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::Role;
    use serde_json::json;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(count_text("gpt-4", ""), 0);
    }

    #[test]
    fn text_counts_are_positive_and_monotonic() {
        let short = count_text("gpt-4", "hello");
        let long = count_text("gpt-4", "hello world, this is a longer sentence");
        assert!(short > 0);
        assert!(long > short);
    }

    #[test]
    fn messages_include_framing_overhead() {
        let messages = vec![Message::text(Role::User, "hi")];
        let tokens = count_messages("gpt-4", &messages);
        assert!(tokens > count_text("gpt-4", "hi") + TOKENS_PER_MESSAGE);
    }

    #[test]
    fn fill_usage_keeps_reported_values() {
        let reported = Usage::new(12, 30);
        assert_eq!(fill_usage("gpt-4", 99, reported, "ignored"), reported);

        let filled = fill_usage("gpt-4", 99, Usage::default(), "some completion text");
        assert_eq!(filled.prompt_tokens, 99);
        assert_eq!(filled.completion_tokens, count_text("gpt-4", "some completion text"));
    }

    #[test]
    fn value_counts_arrays_and_documents() {
        let single = count_value("gpt-4", &json!("query text"));
        let docs = count_value("gpt-4", &json!(["query text", {"text": "query text"}]));
        assert_eq!(docs, single * 2);
        assert_eq!(count_value("gpt-4", &json!(42)), 0);
    }
}
