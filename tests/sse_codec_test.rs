//! 上游 SSE 解码行为

use bytes::BytesMut;
use relay_gateway::providers::sse::{SseDecoder, done_frame, encode_data};
use serde_json::Value;
use tokio_util::codec::Decoder;

#[test]
fn sse_single_event_basic_json() {
    let mut codec = SseDecoder::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"data: {\"a\":1}\n\n");

    let ev = codec.decode(&mut buf).unwrap().expect("one event");
    assert_eq!(ev.event, None);
    assert_eq!(ev.id, None);
    assert_eq!(ev.retry, None);
    let v: Value = ev.json().unwrap().unwrap();
    assert_eq!(v.get("a").and_then(Value::as_i64), Some(1));
}

#[test]
fn sse_multi_line_data_and_comment_lines() {
    let mut codec = SseDecoder::new();
    let mut buf = BytesMut::new();
    // 注释行忽略，多行 data 合并
    buf.extend_from_slice(b": keep-alive\n");
    buf.extend_from_slice(b"data: {\n");
    buf.extend_from_slice(b"data:  \"x\": 42\n");
    buf.extend_from_slice(b"data: }\n\n");

    let ev = codec.decode(&mut buf).unwrap().expect("one event");
    let v: Value = ev.json().unwrap().unwrap();
    assert_eq!(v.get("x").and_then(Value::as_i64), Some(42));
}

#[test]
fn sse_cross_chunk_and_crlf() {
    let mut codec = SseDecoder::new();
    let mut buf1 = BytesMut::new();
    let mut buf2 = BytesMut::new();
    buf1.extend_from_slice(b"event: content_block_delta\r\n");
    buf1.extend_from_slice(b"id: 123\r\n");
    buf1.extend_from_slice(b"data: {\"k\":\"v\"}\r\n");
    assert!(
        codec.decode(&mut buf1).unwrap().is_none(),
        "no complete event yet"
    );

    buf2.extend_from_slice(b"\r\n");
    let ev = codec
        .decode(&mut buf2)
        .unwrap()
        .expect("event after boundary");
    assert_eq!(ev.event.as_deref(), Some("content_block_delta"));
    assert_eq!(ev.id.as_deref(), Some("123"));
    let v: Value = ev.json().unwrap().unwrap();
    assert_eq!(v.get("k").and_then(Value::as_str), Some("v"));
}

#[test]
fn sse_done_event_has_no_json() {
    let mut codec = SseDecoder::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"data: [DONE]\n\n");
    let ev = codec.decode(&mut buf).unwrap().expect("one event");
    assert!(ev.is_done());
    assert!(ev.json::<Value>().unwrap().is_none());
}

#[test]
fn sse_unterminated_tail_is_flushed_at_eof() {
    let mut codec = SseDecoder::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"data: {\"a\":1}\n\ndata: {\"b\":2}");

    let first = codec.decode(&mut buf).unwrap().expect("first event");
    assert_eq!(first.data, "{\"a\":1}");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    let last = codec.decode_eof(&mut buf).unwrap().expect("tail event");
    assert_eq!(last.data, "{\"b\":2}");
}

#[test]
fn downstream_frames_are_data_lines() {
    assert_eq!(&encode_data("{}")[..], b"data: {}\n\n");
    assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");
}
