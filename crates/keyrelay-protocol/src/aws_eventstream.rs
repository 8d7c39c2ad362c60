//! AWS `application/vnd.amazon.eventstream` binary framing.
//!
//! Frame layout (all integers big-endian):
//! `total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32`

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes};
use serde_json::Value;

use crate::error::StreamError;
use crate::sse::encode_sse;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStreamMessage {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl EventStreamMessage {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(key, value)| match value {
            HeaderValue::String(s) if key == name => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }
}

/// Incremental decoder; feed it raw body chunks in arrival order.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<EventStreamMessage>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < PRELUDE_LEN {
                break;
            }
            let total_len = read_u32(&self.buffer[0..4]) as usize;
            if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&total_len) {
                return Err(StreamError::Malformed(format!(
                    "event-stream frame length {total_len} out of range"
                )));
            }
            if self.buffer.len() < total_len {
                break;
            }
            let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
            messages.push(decode_frame(&frame)?);
        }

        Ok(messages)
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode_frame(frame: &[u8]) -> Result<EventStreamMessage, StreamError> {
    let total_len = frame.len();
    let headers_len = read_u32(&frame[4..8]) as usize;
    let prelude_crc = read_u32(&frame[8..12]);
    if crc32fast::hash(&frame[0..8]) != prelude_crc {
        return Err(StreamError::Malformed("event-stream prelude CRC mismatch".into()));
    }
    let message_crc = read_u32(&frame[total_len - TRAILER_LEN..]);
    if crc32fast::hash(&frame[..total_len - TRAILER_LEN]) != message_crc {
        return Err(StreamError::Malformed("event-stream message CRC mismatch".into()));
    }
    if PRELUDE_LEN + headers_len > total_len - TRAILER_LEN {
        return Err(StreamError::Malformed("event-stream headers overrun frame".into()));
    }

    let headers = decode_headers(&frame[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
    let payload = Bytes::copy_from_slice(&frame[PRELUDE_LEN + headers_len..total_len - TRAILER_LEN]);
    Ok(EventStreamMessage { headers, payload })
}

fn decode_headers(mut raw: &[u8]) -> Result<Vec<(String, HeaderValue)>, StreamError> {
    let truncated = || StreamError::Malformed("truncated event-stream header".into());
    let mut headers = Vec::new();

    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        if raw.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&raw[..name_len]).into_owned();
        raw.advance(name_len);
        let kind = raw.get_u8();
        let need = match kind {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            6 | 7 => {
                if raw.remaining() < 2 {
                    return Err(truncated());
                }
                2 + u16::from_be_bytes([raw[0], raw[1]]) as usize
            }
            9 => 16,
            other => {
                return Err(StreamError::Malformed(format!(
                    "unknown event-stream header type {other}"
                )));
            }
        };
        if raw.remaining() < need {
            return Err(truncated());
        }
        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(raw.get_i8()),
            3 => HeaderValue::Short(raw.get_i16()),
            4 => HeaderValue::Int(raw.get_i32()),
            5 => HeaderValue::Long(raw.get_i64()),
            8 => HeaderValue::Timestamp(raw.get_i64()),
            6 => {
                let len = raw.get_u16() as usize;
                let value = Bytes::copy_from_slice(&raw[..len]);
                raw.advance(len);
                HeaderValue::Bytes(value)
            }
            7 => {
                let len = raw.get_u16() as usize;
                let value = String::from_utf8_lossy(&raw[..len]).into_owned();
                raw.advance(len);
                HeaderValue::String(value)
            }
            _ => {
                let mut uuid = [0u8; 16];
                raw.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
        };
        headers.push((name, value));
    }

    Ok(headers)
}

/// Converts one decoded message into an equivalent textual SSE message.
///
/// Returns `Ok(None)` for message kinds that carry nothing for the client.
/// Exception and error messages become typed errors instead of frames.
pub fn aws_message_to_sse(message: &EventStreamMessage) -> Result<Option<String>, StreamError> {
    match message.message_type() {
        Some("event") => event_to_sse(message),
        Some("exception") | Some("error") => Err(exception_to_error(message)),
        Some(other) => Err(StreamError::Malformed(format!(
            "unexpected event-stream message type {other}"
        ))),
        None => Err(StreamError::Malformed(
            "event-stream message without :message-type".into(),
        )),
    }
}

fn event_to_sse(message: &EventStreamMessage) -> Result<Option<String>, StreamError> {
    let event_type = message.header_str(":event-type").unwrap_or_default();
    if event_type != "chunk" {
        if message.payload.is_empty() {
            return Ok(None);
        }
        let data = String::from_utf8_lossy(&message.payload);
        return Ok(Some(trim_frame(encode_sse(Some(event_type), &data))));
    }

    let envelope: Value = serde_json::from_slice(&message.payload)
        .map_err(|err| StreamError::Malformed(format!("chunk payload is not JSON: {err}")))?;
    let encoded = envelope
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::Malformed("chunk payload has no bytes field".into()))?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|err| StreamError::Malformed(format!("chunk bytes are not base64: {err}")))?;
    let inner: Value = serde_json::from_slice(&decoded)
        .map_err(|err| StreamError::Malformed(format!("chunk body is not JSON: {err}")))?;

    let sse_event = inner
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("completion")
        .to_string();
    let data = serde_json::to_string(&inner)
        .map_err(|err| StreamError::Malformed(err.to_string()))?;
    Ok(Some(trim_frame(encode_sse(Some(&sse_event), &data))))
}

fn trim_frame(frame: String) -> String {
    frame.trim_end_matches('\n').to_string()
}

fn exception_to_error(message: &EventStreamMessage) -> StreamError {
    let kind = message
        .header_str(":exception-type")
        .or_else(|| message.header_str(":error-code"))
        .unwrap_or("UnknownError")
        .to_string();
    let body: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
    let detail = body
        .get("message")
        .or_else(|| body.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| message.header_str(":error-message").map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&message.payload).into_owned());

    match kind.to_ascii_lowercase().as_str() {
        "throttlingexception" => StreamError::RateLimited(format!("{kind}: {detail}")),
        "serviceunavailableexception" | "modelnotreadyexception" => {
            StreamError::Overloaded(format!("{kind}: {detail}"))
        }
        "validationexception" => StreamError::BadRequest(format!("{kind}: {detail}")),
        _ => StreamError::Upstream {
            kind,
            message: detail,
        },
    }
}

/// Builds a frame; used by tests and by anything replaying captured streams.
pub fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }
    let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + TRAILER_LEN;

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_frame(inner: &Value) -> Vec<u8> {
        let bytes = STANDARD.encode(serde_json::to_vec(inner).unwrap());
        let payload = serde_json::json!({ "bytes": bytes });
        encode_message(
            &[
                (":message-type", "event"),
                (":event-type", "chunk"),
                (":content-type", "application/json"),
            ],
            &serde_json::to_vec(&payload).unwrap(),
        )
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let inner = serde_json::json!({"type":"content_block_delta","delta":{"text":"hi"}});
        let mut raw = chunk_frame(&inner);
        raw.extend(chunk_frame(&inner));

        let mut decoder = EventStreamDecoder::new();
        let mut messages = Vec::new();
        for piece in raw.chunks(7) {
            messages.extend(decoder.push(piece).unwrap());
        }
        assert_eq!(messages.len(), 2);
        assert!(!decoder.has_pending());

        let sse = aws_message_to_sse(&messages[0]).unwrap().unwrap();
        assert!(sse.starts_with("event: content_block_delta\ndata: "));
        let data = sse.split_once("data: ").unwrap().1;
        let parsed: Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed, inner);
    }

    #[test]
    fn legacy_completion_chunks_use_completion_event() {
        let inner = serde_json::json!({"completion":" hi","stop_reason":null});
        let mut decoder = EventStreamDecoder::new();
        let messages = decoder.push(&chunk_frame(&inner)).unwrap();
        let sse = aws_message_to_sse(&messages[0]).unwrap().unwrap();
        assert!(sse.starts_with("event: completion\n"));
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut raw = chunk_frame(&serde_json::json!({"a":1}));
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let err = EventStreamDecoder::new().push(&raw).unwrap_err();
        assert!(matches!(err, StreamError::Malformed(_)));
    }

    #[test]
    fn exceptions_map_to_typed_errors() {
        let throttled = encode_message(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"Too many requests"}"#,
        );
        let invalid = encode_message(
            &[
                (":message-type", "exception"),
                (":exception-type", "validationException"),
            ],
            br#"{"message":"bad"}"#,
        );
        let other = encode_message(
            &[(":message-type", "error"), (":error-code", "InternalFailure")],
            b"{}",
        );

        let mut decoder = EventStreamDecoder::new();
        let mut raw = throttled;
        raw.extend(invalid);
        raw.extend(other);
        let messages = decoder.push(&raw).unwrap();

        assert!(matches!(
            aws_message_to_sse(&messages[0]),
            Err(StreamError::RateLimited(_))
        ));
        assert!(matches!(
            aws_message_to_sse(&messages[1]),
            Err(StreamError::BadRequest(_))
        ));
        match aws_message_to_sse(&messages[2]) {
            Err(StreamError::Upstream { kind, .. }) => assert_eq!(kind, "InternalFailure"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
