use keyrelay_common::ApiFormat;
use keyrelay_protocol::{ChatCompletionChunk, is_comment_only};

use super::{StreamEvent, TransformParams, Transformer, select_transformer};

/// Runs one upstream stream through its transformer, threading the running
/// position between calls and announcing the assistant role first.
#[derive(Debug, Clone)]
pub struct SseMessageTransformer {
    transform: Transformer,
    last_position: usize,
    message_index: usize,
    fallback_id: String,
    fallback_model: String,
    role_sent: bool,
}

impl SseMessageTransformer {
    pub fn new(
        upstream: ApiFormat,
        client: ApiFormat,
        fallback_id: impl Into<String>,
        fallback_model: impl Into<String>,
    ) -> Self {
        Self::with_transformer(
            select_transformer(upstream, client),
            fallback_id,
            fallback_model,
        )
    }

    pub fn with_transformer(
        transform: Transformer,
        fallback_id: impl Into<String>,
        fallback_model: impl Into<String>,
    ) -> Self {
        Self {
            transform,
            last_position: 0,
            message_index: 0,
            fallback_id: fallback_id.into(),
            fallback_model: fallback_model.into(),
            role_sent: false,
        }
    }

    pub fn push(&mut self, message: &str) -> Vec<StreamEvent> {
        if is_comment_only(message) {
            return Vec::new();
        }
        let output = (self.transform)(TransformParams {
            data: message,
            last_position: self.last_position,
            index: self.message_index,
            fallback_id: &self.fallback_id,
            fallback_model: &self.fallback_model,
        });
        self.last_position = output.position;
        self.message_index += 1;

        match output.event {
            Some(StreamEvent::OpenAI(chunk)) => self.announce_role(chunk),
            Some(other) => vec![other],
            None => Vec::new(),
        }
    }

    pub fn messages_seen(&self) -> usize {
        self.message_index
    }

    fn announce_role(&mut self, mut chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.role_sent {
            return vec![StreamEvent::OpenAI(chunk)];
        }
        self.role_sent = true;

        let carries_payload = !chunk.content().is_empty() || chunk.finish_reason().is_some();
        if !carries_payload {
            if let Some(choice) = chunk.choices.first_mut() {
                choice.delta.role = Some("assistant".to_string());
                choice.delta.content = Some(String::new());
            }
            return vec![StreamEvent::OpenAI(chunk)];
        }

        let announcement = ChatCompletionChunk::role_announcement(&chunk.id, &chunk.model);
        vec![StreamEvent::OpenAI(announcement), StreamEvent::OpenAI(chunk)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(events: &[StreamEvent]) -> Vec<(Option<String>, String)> {
        events
            .iter()
            .map(|event| match event {
                StreamEvent::OpenAI(chunk) => (
                    chunk.choices[0].delta.role.clone(),
                    chunk.content().to_string(),
                ),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn threads_position_through_cumulative_stream() {
        let mut transformer =
            SseMessageTransformer::new(ApiFormat::AnthropicText, ApiFormat::OpenAI, "id", "claude-v1");
        let mut events = Vec::new();
        for completion in ["Hello", "Hello world", "Hello world!"] {
            events.extend(transformer.push(&format!("data: {{\"completion\":\"{completion}\"}}")));
        }
        assert_eq!(
            contents(&events),
            vec![
                (Some("assistant".to_string()), String::new()),
                (None, "Hello".to_string()),
                (None, " world".to_string()),
                (None, "!".to_string()),
            ]
        );
        assert_eq!(transformer.messages_seen(), 3);
    }

    #[test]
    fn empty_first_chunk_is_rewritten_into_announcement() {
        let mut transformer =
            SseMessageTransformer::new(ApiFormat::GoogleAI, ApiFormat::OpenAI, "id", "gemini-pro");
        let events = transformer
            .push(r#"data: {"candidates":[{"content":{"parts":[{"text":""}]},"index":0}]}"#);
        assert_eq!(contents(&events), vec![(Some("assistant".to_string()), String::new())]);
    }

    #[test]
    fn comments_are_skipped() {
        let mut transformer =
            SseMessageTransformer::new(ApiFormat::OpenAI, ApiFormat::OpenAI, "id", "gpt-4");
        assert!(transformer.push(": keep-alive").is_empty());
        assert_eq!(transformer.messages_seen(), 0);
    }
}
