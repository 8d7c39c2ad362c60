//! Per-message stream transformers.
//!
//! Every transformer is a pure function of one framed SSE message plus the running
//! position of the stream. Delta-style vendors return the position unchanged;
//! cumulative vendors return the length of the completion seen so far, and the
//! caller must feed it back on the next call.

mod anthropic;
mod google_ai;
mod message_transformer;
mod openai;

pub use anthropic::{
    anthropic_chat_to_anthropic_v2, anthropic_chat_to_openai, anthropic_text_to_openai,
    anthropic_v1_to_openai, anthropic_v2_to_openai,
};
pub use google_ai::google_ai_to_openai;
pub use message_transformer::SseMessageTransformer;
pub use openai::{mistral_text_to_openai, openai_text_to_openai_chat, passthrough_to_openai};

use keyrelay_common::ApiFormat;
use keyrelay_protocol::{ChatCompletionChunk, ServerSentEvent};
use serde::{Deserialize, Serialize};

use crate::finish;

/// A stream event after the first transform stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Canonical OpenAI-shaped chunk.
    OpenAI(ChatCompletionChunk),
    /// Legacy Anthropic text-completion event, produced when a chat upstream
    /// serves a text-completion client.
    AnthropicV2(AnthropicTextEvent),
}

impl StreamEvent {
    pub fn into_canonical(self) -> ChatCompletionChunk {
        match self {
            StreamEvent::OpenAI(chunk) => chunk,
            StreamEvent::AnthropicV2(event) => event.into_canonical(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicTextEvent {
    #[serde(rename = "type", default = "completion_type")]
    pub kind: String,
    #[serde(default)]
    pub completion: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub log_id: String,
}

fn completion_type() -> String {
    "completion".to_string()
}

impl AnthropicTextEvent {
    pub fn new(
        completion: impl Into<String>,
        stop_reason: Option<String>,
        model: &str,
        log_id: &str,
    ) -> Self {
        Self {
            kind: completion_type(),
            completion: completion.into(),
            stop_reason,
            model: model.to_string(),
            log_id: log_id.to_string(),
        }
    }

    pub fn into_canonical(self) -> ChatCompletionChunk {
        let finish_reason = self.stop_reason.as_deref().map(finish::from_anthropic);
        ChatCompletionChunk::new(self.log_id, self.model, Some(self.completion), finish_reason)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransformParams<'a> {
    /// One framed SSE message, line endings already normalized.
    pub data: &'a str,
    pub last_position: usize,
    /// Zero-based index of this message within the stream.
    pub index: usize,
    pub fallback_id: &'a str,
    pub fallback_model: &'a str,
}

impl<'a> TransformParams<'a> {
    fn unchanged(&self, event: Option<StreamEvent>) -> TransformOutput {
        TransformOutput {
            position: self.last_position,
            event,
        }
    }

    fn parse(&self) -> ServerSentEvent {
        ServerSentEvent::parse(self.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub position: usize,
    pub event: Option<StreamEvent>,
}

pub type Transformer = fn(TransformParams<'_>) -> TransformOutput;

/// Picks the first-stage transformer for an upstream stream.
///
/// `client` matters only where the conversion stays inside one vendor instead of
/// passing through the canonical shape.
pub fn select_transformer(upstream: ApiFormat, client: ApiFormat) -> Transformer {
    match upstream {
        ApiFormat::OpenAI | ApiFormat::MistralAI | ApiFormat::OpenAIImage => passthrough_to_openai,
        ApiFormat::OpenAIText => openai_text_to_openai_chat,
        ApiFormat::AnthropicText => anthropic_text_to_openai,
        ApiFormat::AnthropicChat if client == ApiFormat::AnthropicText => {
            anthropic_chat_to_anthropic_v2
        }
        ApiFormat::AnthropicChat => anthropic_chat_to_openai,
        ApiFormat::GoogleAI => google_ai_to_openai,
        ApiFormat::MistralText => mistral_text_to_openai,
    }
}

fn string_field<'v>(value: &'v serde_json::Value, field: &str) -> Option<&'v str> {
    value.get(field).and_then(serde_json::Value::as_str)
}
