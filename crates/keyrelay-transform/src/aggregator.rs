use keyrelay_common::ApiFormat;
use keyrelay_protocol::ChatCompletionChunk;
use serde_json::{Value, json};

use crate::blocking::CanonicalCompletion;
use crate::error::AggregateError;
use crate::finish;
use crate::stream::StreamEvent;

/// Shadows a client stream and folds it into one response body for accounting.
#[derive(Debug, Clone)]
pub struct EventAggregator {
    format: ApiFormat,
    events: Vec<ChatCompletionChunk>,
}

impl EventAggregator {
    pub fn new(format: ApiFormat) -> Self {
        Self {
            format,
            events: Vec::new(),
        }
    }

    pub fn add_event(&mut self, event: StreamEvent) {
        self.events.push(event.into_canonical());
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Dialect of the body built by `get_final_response`. Google AI clients
    /// stream OpenAI chunks, so their merged body has the OpenAI shape.
    pub fn body_format(&self) -> ApiFormat {
        match self.format {
            ApiFormat::GoogleAI => ApiFormat::OpenAI,
            format => format,
        }
    }

    /// Concatenated content of every event so far.
    pub fn text(&self) -> String {
        self.events.iter().map(ChatCompletionChunk::content).collect()
    }

    pub fn has_content(&self) -> bool {
        self.events.iter().any(|event| !event.content().is_empty())
    }

    fn merged(&self) -> CanonicalCompletion {
        let first = self.events.first();
        CanonicalCompletion {
            id: first.map(|event| event.id.clone()).unwrap_or_default(),
            model: first.map(|event| event.model.clone()).unwrap_or_default(),
            text: self.text(),
            finish_reason: self
                .events
                .iter()
                .rev()
                .find_map(|event| event.finish_reason().map(str::to_string)),
            prompt_tokens: None,
            output_tokens: None,
        }
    }

    pub fn get_final_response(&self) -> Result<Value, AggregateError> {
        let merged = self.merged();
        let created = self.events.first().map(|event| event.created).unwrap_or(0);
        let finish_reason = merged.finish_reason.as_deref();

        let body = match self.format {
            ApiFormat::OpenAI | ApiFormat::GoogleAI | ApiFormat::MistralAI => json!({
                "id": merged.id,
                "object": "chat.completion",
                "created": created,
                "model": merged.model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": merged.text},
                    "finish_reason": finish_reason,
                }],
            }),
            ApiFormat::OpenAIText => json!({
                "id": merged.id,
                "object": "text_completion",
                "created": created,
                "model": merged.model,
                "choices": [{
                    "text": merged.text,
                    "index": 0,
                    "logprobs": null,
                    "finish_reason": finish_reason,
                }],
            }),
            ApiFormat::AnthropicText => json!({
                "type": "completion",
                "id": merged.id,
                "completion": merged.text,
                "stop_reason": finish_reason.map(finish::to_anthropic_text),
                "model": merged.model,
            }),
            ApiFormat::AnthropicChat => json!({
                "id": merged.id,
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": merged.text}],
                "model": merged.model,
                "stop_reason": finish_reason.map(finish::to_anthropic_chat),
                "stop_sequence": null,
            }),
            ApiFormat::MistralText => json!({
                "outputs": [{"text": merged.text, "stop_reason": finish_reason}],
            }),
            ApiFormat::OpenAIImage => return Err(AggregateError::Unsupported(self.format)),
        };
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::AnthropicTextEvent;

    fn delta(n: usize) -> StreamEvent {
        StreamEvent::OpenAI(ChatCompletionChunk::new(
            "chatcmpl-1",
            "gpt-4",
            Some(format!("t{n} ")),
            None,
        ))
    }

    #[test]
    fn concatenation_matches_final_content() {
        for n in 0..=100 {
            let mut aggregator = EventAggregator::new(ApiFormat::OpenAI);
            let mut expected = String::new();
            for i in 0..n {
                let event = delta(i);
                if let StreamEvent::OpenAI(chunk) = &event {
                    expected.push_str(chunk.content());
                }
                aggregator.add_event(event);
            }
            let body = aggregator.get_final_response().unwrap();
            assert_eq!(body["choices"][0]["message"]["content"], expected.as_str(), "n = {n}");
        }
    }

    #[test]
    fn keeps_last_non_null_finish_reason() {
        let mut aggregator = EventAggregator::new(ApiFormat::OpenAI);
        aggregator.add_event(delta(0));
        aggregator.add_event(StreamEvent::OpenAI(ChatCompletionChunk::new(
            "chatcmpl-1",
            "gpt-4",
            None,
            Some("length".into()),
        )));
        aggregator.add_event(delta(1));
        let body = aggregator.get_final_response().unwrap();
        assert_eq!(body["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn converts_legacy_anthropic_events_before_storing() {
        let mut aggregator = EventAggregator::new(ApiFormat::AnthropicText);
        aggregator.add_event(StreamEvent::AnthropicV2(AnthropicTextEvent::new(
            "Hel", None, "claude-2", "log",
        )));
        aggregator.add_event(StreamEvent::AnthropicV2(AnthropicTextEvent::new(
            "lo",
            Some("stop_sequence".into()),
            "claude-2",
            "log",
        )));
        let body = aggregator.get_final_response().unwrap();
        assert_eq!(body["completion"], "Hello");
        assert_eq!(body["stop_reason"], "stop_sequence");
        assert_eq!(body["id"], "log");
    }

    #[test]
    fn anthropic_chat_merge_uses_vendor_field_names() {
        let mut aggregator = EventAggregator::new(ApiFormat::AnthropicChat);
        aggregator.add_event(delta(0));
        aggregator.add_event(StreamEvent::OpenAI(ChatCompletionChunk::new(
            "chatcmpl-1",
            "gpt-4",
            None,
            Some("stop".into()),
        )));
        let body = aggregator.get_final_response().unwrap();
        assert_eq!(body["content"][0]["text"], "t0 ");
        assert_eq!(body["stop_reason"], "end_turn");
    }

    #[test]
    fn merged_body_reads_back_in_its_own_dialect() {
        for format in [ApiFormat::GoogleAI, ApiFormat::AnthropicText, ApiFormat::MistralText] {
            let mut aggregator = EventAggregator::new(format);
            aggregator.add_event(delta(0));
            aggregator.add_event(delta(1));
            let body = aggregator.get_final_response().unwrap();
            let completion = CanonicalCompletion::from_upstream(aggregator.body_format(), &body)
                .unwrap_or_else(|err| panic!("{format}: {err}"));
            assert_eq!(completion.text, "t0 t1 ", "{format}");
        }
    }

    #[test]
    fn image_generation_cannot_be_aggregated() {
        let aggregator = EventAggregator::new(ApiFormat::OpenAIImage);
        assert_eq!(
            aggregator.get_final_response(),
            Err(AggregateError::Unsupported(ApiFormat::OpenAIImage))
        );
    }
}
