//! # AI服务提供商适配器模块
//!
//! 以 OpenAI 协议为规范格式，各供应商适配器负责请求与响应互转

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod sse;
pub mod tokenizer;
pub mod traits;
pub mod types;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use registry::AdapterRegistry;
pub use sse::{SseDecoder, SseEvent, StreamFrame};
pub use traits::{ProviderAdapter, StreamConverter, StreamSummary, UpstreamTarget};
pub use types::{
    ChatChunk, ChatRequest, ChatResponse, ConvertedResponse, Message, MessageContent,
    ProviderError, ProviderResult, RelayMode, RelayRequest, Role, Usage,
};
