//! # 请求校验与提示词计量

use serde_json::Value;

use crate::ensure_validation;
use crate::error::{ProxyError, Result};
use crate::providers::tokenizer;
use crate::providers::{ChatRequest, RelayMode, RelayRequest};

/// 解析客户端请求体
pub fn parse_request(mode: RelayMode, body: Value) -> Result<RelayRequest> {
    if !body.is_object() {
        return Err(ProxyError::validation("request body must be a JSON object"));
    }
    match mode {
        RelayMode::ChatCompletions => serde_json::from_value::<ChatRequest>(body)
            .map(RelayRequest::Chat)
            .map_err(|e| ProxyError::validation(format!("invalid chat request: {e}"))),
        mode => Ok(RelayRequest::Passthrough { mode, body }),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// 按中继模式校验必填字段与 max_tokens 上限
pub fn validate_request(request: &RelayRequest, max_tokens_ceiling: u64) -> Result<()> {
    ensure_validation!(!request.model().trim().is_empty(), "model is required");
    if let Some(max_tokens) = request.max_tokens() {
        ensure_validation!(
            max_tokens <= max_tokens_ceiling,
            "max_tokens is invalid: {} exceeds {}",
            max_tokens,
            max_tokens_ceiling
        );
    }

    match request {
        RelayRequest::Chat(chat) => {
            ensure_validation!(!chat.messages.is_empty(), "messages is required");
        }
        RelayRequest::Passthrough { mode, body } => match mode {
            RelayMode::Completions if is_blank(body.get("prompt")) => {
                return Err(ProxyError::validation("prompt is required"));
            }
            RelayMode::Embeddings | RelayMode::Moderations if is_blank(body.get("input")) => {
                return Err(ProxyError::validation("input is required"));
            }
            RelayMode::Rerank => {
                ensure_validation!(!is_blank(body.get("query")), "query is empty");
                ensure_validation!(!is_blank(body.get("documents")), "documents is empty");
            }
            _ => {}
        },
    }
    Ok(())
}

/// 本地估算提示词 token
pub fn prompt_tokens(request: &RelayRequest) -> u32 {
    let model = request.model();
    match request {
        RelayRequest::Chat(chat) => tokenizer::count_messages(model, &chat.messages),
        RelayRequest::Passthrough { mode, body } => {
            let count = |field: &str| {
                body.get(field)
                    .map_or(0, |value| tokenizer::count_value(model, value))
            };
            match mode {
                RelayMode::Completions => count("prompt"),
                RelayMode::Embeddings | RelayMode::Moderations => count("input"),
                RelayMode::Rerank => count("query").saturating_add(count("documents")),
                RelayMode::ChatCompletions => body
                    .get("messages")
                    .map_or(0, |messages| tokenizer::count_value(model, messages)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const CEILING: u64 = (i32::MAX / 2) as u64;

    #[rstest]
    #[case(RelayMode::Completions, json!({"model": "m"}), "prompt is required")]
    #[case(RelayMode::Embeddings, json!({"model": "m", "input": ""}), "input is required")]
    #[case(RelayMode::Moderations, json!({"model": "m", "input": []}), "input is required")]
    #[case(RelayMode::Rerank, json!({"model": "m", "query": "", "documents": ["a"]}), "query is empty")]
    #[case(RelayMode::Rerank, json!({"model": "m", "query": "q", "documents": []}), "documents is empty")]
    #[case(RelayMode::ChatCompletions, json!({"model": "m", "messages": []}), "messages is required")]
    #[case(RelayMode::ChatCompletions, json!({"model": "", "messages": [{"role": "user", "content": "x"}]}), "model is required")]
    fn missing_fields_are_rejected(
        #[case] mode: RelayMode,
        #[case] body: Value,
        #[case] message: &str,
    ) {
        let request = parse_request(mode, body).unwrap();
        let err = validate_request(&request, CEILING).unwrap_err();
        assert_eq!(err.to_string(), message);
        assert_eq!(err.to_http_response_parts().0.as_u16(), 400);
    }

    #[test]
    fn max_tokens_ceiling_is_enforced() {
        let request = parse_request(
            RelayMode::ChatCompletions,
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}], "max_tokens": CEILING + 1}),
        )
        .unwrap();
        let err = validate_request(&request, CEILING).unwrap_err();
        assert!(err.to_string().starts_with("max_tokens is invalid"));

        let request = parse_request(
            RelayMode::Completions,
            json!({"model": "gpt-3.5-turbo-instruct", "prompt": "hi", "max_tokens": 100}),
        )
        .unwrap();
        assert!(validate_request(&request, 99).is_err());
        assert!(validate_request(&request, 100).is_ok());
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(parse_request(RelayMode::Embeddings, json!(["x"])).is_err());
    }

    #[test]
    fn rerank_prompt_counts_query_and_documents() {
        let request = parse_request(
            RelayMode::Rerank,
            json!({"model": "rerank-1", "query": "apple", "documents": ["apple", "apple"]}),
        )
        .unwrap();
        let query_only = tokenizer::count_text("rerank-1", "apple");
        assert_eq!(prompt_tokens(&request), query_only * 3);
    }

    #[test]
    fn chat_prompt_counts_messages() {
        let request = parse_request(
            RelayMode::ChatCompletions,
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hello"}]}),
        )
        .unwrap();
        assert!(prompt_tokens(&request) > tokenizer::count_text("gpt-4", "hello"));
    }
}
