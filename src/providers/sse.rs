//! # SSE 编解码
//!
//! 解码上游 `text/event-stream` 字节流为事件，编码下游 `data: ...` 帧。

use std::io;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use super::types::{ChatChunk, ProviderError, ProviderResult};

/// 流结束标记
pub const DONE_MARKER: &str = "[DONE]";

/// 一个完整的 SSE 事件，`data` 为多行拼接后的原始文本
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    /// 将 data 解析为 JSON；空数据或结束标记返回 `None`
    pub fn json<T: DeserializeOwned>(&self) -> ProviderResult<Option<T>> {
        let payload = self.data.trim();
        if payload.is_empty() || payload == DONE_MARKER {
            return Ok(None);
        }
        serde_json::from_str(payload)
            .map(Some)
            .map_err(|e| ProviderError::StreamParseError(format!("{e}: {payload}")))
    }
}

/// 增量 SSE 解码器，跨 chunk 保留未完成的事件
#[derive(Debug, Clone, Default)]
pub struct SseDecoder {
    current: SseEvent,
    has_any: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if !self.has_any {
            return None;
        }
        self.has_any = false;
        Some(std::mem::take(&mut self.current))
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').map_or((line, ""), |(f, v)| {
            (f, v.strip_prefix(' ').unwrap_or(v))
        });

        match field {
            "data" => {
                if self.has_any && !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "retry" => self.current.retry = value.parse().ok(),
            _ => return None,
        }
        self.has_any = true;
        None
    }

    fn take_line(src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line = src.split_to(pos + 1);
        line.truncate(line.len() - 1);
        if line.ends_with(b"\r") {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = Self::take_line(src)? {
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if !src.is_empty() {
            let rest = src.split_to(src.len());
            let line = String::from_utf8(rest.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Some(event) = self.process_line(line.trim_end_matches(['\r', '\n'])) {
                return Ok(Some(event));
            }
        }
        Ok(self.take_event())
    }
}

/// 发往客户端的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Chunk(Box<ChatChunk>),
    /// 上游原样透传的 data 负载
    Raw(String),
}

impl StreamFrame {
    pub fn chunk(chunk: ChatChunk) -> Self {
        Self::Chunk(Box::new(chunk))
    }

    pub fn to_bytes(&self) -> ProviderResult<Bytes> {
        let payload = match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk)?,
            Self::Raw(raw) => raw.clone(),
        };
        Ok(encode_data(&payload))
    }
}

pub fn encode_data(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

pub fn done_frame() -> Bytes {
    encode_data(DONE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_fields_are_collected() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from("event: message_start\nid: 7\nretry: 100\ndata: {\"a\":1}\n\n");
        let ev = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ev.event.as_deref(), Some("message_start"));
        assert_eq!(ev.id.as_deref(), Some("7"));
        assert_eq!(ev.retry, Some(100));
        assert_eq!(ev.data, "{\"a\":1}");
    }

    #[test]
    fn unknown_fields_do_not_start_an_event() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from("foo: bar\n\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_flushes_unterminated_event() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from("data: {\"x\":true}");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let ev = codec.decode_eof(&mut buf).unwrap().unwrap();
        let value: serde_json::Value = ev.json().unwrap().unwrap();
        assert_eq!(value["x"], true);
    }

    #[test]
    fn frames_are_encoded_as_data_lines() {
        assert_eq!(done_frame(), Bytes::from_static(b"data: [DONE]\n\n"));
        let frame = StreamFrame::Raw("{}".to_string());
        assert_eq!(frame.to_bytes().unwrap(), Bytes::from_static(b"data: {}\n\n"));
    }
}
