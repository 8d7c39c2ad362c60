//! Canonical events back into the stream grammar the client asked for.

use keyrelay_common::ApiFormat;
use keyrelay_protocol::sse::OPENAI_DONE_FRAME;
use keyrelay_protocol::{ChatCompletionChunk, encode_sse};
use serde_json::{Value, json};

use crate::finish;
use crate::stream::{AnthropicTextEvent, StreamEvent};

/// Stateful re-encoder for one client stream. Every returned string is a complete
/// SSE frame including its blank-line terminator.
#[derive(Debug, Clone)]
pub struct ClientStreamEncoder {
    format: ApiFormat,
    id: String,
    model: String,
    message_started: bool,
    block_open: bool,
    stop_sent: bool,
}

impl ClientStreamEncoder {
    pub fn new(format: ApiFormat, id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            format,
            id: id.into(),
            model: model.into(),
            message_started: false,
            block_open: false,
            stop_sent: false,
        }
    }

    pub fn format(&self) -> ApiFormat {
        self.format
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match (self.format, event) {
            (ApiFormat::AnthropicText, StreamEvent::AnthropicV2(event)) => {
                vec![anthropic_text_frame(event)]
            }
            (_, StreamEvent::OpenAI(chunk)) => self.encode_chunk(chunk),
            (_, StreamEvent::AnthropicV2(event)) => {
                self.encode_chunk(&event.clone().into_canonical())
            }
        }
    }

    /// Frames that terminate the stream once the upstream has finished.
    pub fn finish(&mut self) -> Vec<String> {
        match self.format {
            ApiFormat::OpenAI | ApiFormat::OpenAIText | ApiFormat::MistralAI => {
                vec![OPENAI_DONE_FRAME.to_string()]
            }
            ApiFormat::AnthropicChat => {
                let mut frames = Vec::new();
                if !self.message_started {
                    frames.extend(self.anthropic_chat_start());
                }
                frames.extend(self.anthropic_chat_stop("end_turn"));
                frames.push(encode_sse(
                    Some("message_stop"),
                    &json!({"type": "message_stop"}).to_string(),
                ));
                frames
            }
            _ => Vec::new(),
        }
    }

    fn encode_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<String> {
        let content = chunk.content();
        let finish_reason = chunk.finish_reason();
        match self.format {
            ApiFormat::OpenAI | ApiFormat::MistralAI => vec![data_frame(&json_of(chunk))],
            ApiFormat::OpenAIText => {
                if chunk.is_role_only() {
                    return Vec::new();
                }
                vec![data_frame(&json!({
                    "id": chunk.id,
                    "object": "text_completion",
                    "created": chunk.created,
                    "model": chunk.model,
                    "choices": [{
                        "text": content,
                        "index": 0,
                        "logprobs": null,
                        "finish_reason": finish_reason,
                    }],
                }))]
            }
            ApiFormat::AnthropicText => {
                if chunk.is_role_only() {
                    return Vec::new();
                }
                let event = AnthropicTextEvent::new(
                    content,
                    finish_reason.map(finish::to_anthropic_text),
                    &chunk.model,
                    &chunk.id,
                );
                vec![anthropic_text_frame(&event)]
            }
            ApiFormat::AnthropicChat => {
                let mut frames = Vec::new();
                if !self.message_started {
                    frames.extend(self.anthropic_chat_start());
                }
                if !content.is_empty() && !self.stop_sent {
                    frames.push(encode_sse(
                        Some("content_block_delta"),
                        &json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "text_delta", "text": content},
                        })
                        .to_string(),
                    ));
                }
                if let Some(reason) = finish_reason {
                    frames.extend(self.anthropic_chat_stop(&finish::to_anthropic_chat(reason)));
                }
                frames
            }
            ApiFormat::GoogleAI => {
                if chunk.is_role_only() {
                    return Vec::new();
                }
                let mut candidate = json!({
                    "content": {"parts": [{"text": content}], "role": "model"},
                    "index": 0,
                });
                if let Some(reason) = finish_reason {
                    candidate["finishReason"] = Value::String(finish::to_google(reason));
                }
                vec![data_frame(&json!({"candidates": [candidate]}))]
            }
            ApiFormat::MistralText => {
                if chunk.is_role_only() {
                    return Vec::new();
                }
                vec![data_frame(&json!({
                    "outputs": [{"text": content, "stop_reason": finish_reason}],
                }))]
            }
            ApiFormat::OpenAIImage => Vec::new(),
        }
    }

    fn anthropic_chat_start(&mut self) -> Vec<String> {
        self.message_started = true;
        self.block_open = true;
        vec![
            encode_sse(
                Some("message_start"),
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                })
                .to_string(),
            ),
            encode_sse(
                Some("content_block_start"),
                &json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""},
                })
                .to_string(),
            ),
        ]
    }

    fn anthropic_chat_stop(&mut self, stop_reason: &str) -> Vec<String> {
        let mut frames = Vec::new();
        if self.block_open {
            self.block_open = false;
            frames.push(encode_sse(
                Some("content_block_stop"),
                &json!({"type": "content_block_stop", "index": 0}).to_string(),
            ));
        }
        if !self.stop_sent {
            self.stop_sent = true;
            frames.push(encode_sse(
                Some("message_delta"),
                &json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"output_tokens": 0},
                })
                .to_string(),
            ));
        }
        frames
    }
}

fn json_of(chunk: &ChatCompletionChunk) -> Value {
    serde_json::to_value(chunk).unwrap_or(Value::Null)
}

fn data_frame(value: &Value) -> String {
    encode_sse(None, &value.to_string())
}

fn anthropic_text_frame(event: &AnthropicTextEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_default();
    encode_sse(Some("completion"), &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str, finish_reason: Option<&str>) -> StreamEvent {
        StreamEvent::OpenAI(ChatCompletionChunk::new(
            "id-1",
            "gpt-4",
            Some(content.to_string()),
            finish_reason.map(str::to_string),
        ))
    }

    #[test]
    fn openai_clients_get_data_frames_and_done() {
        let mut encoder = ClientStreamEncoder::new(ApiFormat::OpenAI, "id-1", "gpt-4");
        let frames = encoder.encode(&chunk("hi", None));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("data: {"));
        assert!(frames[0].ends_with("\n\n"));
        assert_eq!(encoder.finish(), vec![OPENAI_DONE_FRAME.to_string()]);
    }

    #[test]
    fn anthropic_chat_clients_get_full_message_lifecycle() {
        let mut encoder = ClientStreamEncoder::new(ApiFormat::AnthropicChat, "msg-1", "claude-3");
        let mut frames = encoder.encode(&chunk("Hello", None));
        frames.extend(encoder.encode(&chunk("", Some("length"))));
        frames.extend(encoder.finish());

        let events: Vec<&str> = frames
            .iter()
            .map(|frame| {
                frame
                    .lines()
                    .next()
                    .and_then(|line| line.strip_prefix("event: "))
                    .unwrap()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(frames[4].contains("\"max_tokens\""));
    }

    #[test]
    fn role_only_chunks_are_dropped_for_text_clients() {
        let mut encoder = ClientStreamEncoder::new(ApiFormat::AnthropicText, "id", "claude-2");
        let role = StreamEvent::OpenAI(ChatCompletionChunk::role_announcement("id", "claude-2"));
        assert!(encoder.encode(&role).is_empty());
        let frames = encoder.encode(&chunk("x", Some("stop")));
        assert!(frames[0].starts_with("event: completion\n"));
        assert!(frames[0].contains("\"stop_sequence\""));
    }

    #[test]
    fn google_clients_get_candidates() {
        let mut encoder = ClientStreamEncoder::new(ApiFormat::GoogleAI, "id", "gemini");
        let frames = encoder.encode(&chunk("yo", Some("stop")));
        let data = frames[0].strip_prefix("data: ").unwrap().trim_end();
        let value: Value = serde_json::from_str(data).unwrap();
        assert_eq!(value["candidates"][0]["content"]["parts"][0]["text"], "yo");
        assert_eq!(value["candidates"][0]["finishReason"], "STOP");
        assert!(encoder.finish().is_empty());
    }
}
