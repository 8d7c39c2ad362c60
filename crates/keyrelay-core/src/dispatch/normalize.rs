//! Turns an upstream byte stream into frames in the client's stream grammar.

use keyrelay_common::ApiFormat;
use keyrelay_protocol::{
    EventStreamDecoder, ServerSentEvent, SseFramer, StreamError, aws_message_to_sse,
    is_comment_only,
};
use keyrelay_provider_impl::StreamFraming;
use keyrelay_transform::{ClientStreamEncoder, EventAggregator, SseMessageTransformer};
use serde_json::Value;

/// In-band error kinds that mean the key itself is rate limited.
const RATE_LIMIT_STREAM_ERRORS: &[&str] = &["rate_limit_error", "RESOURCE_EXHAUSTED"];
/// In-band error kinds that mean the vendor is busy; the key stays usable.
const OVERLOADED_STREAM_ERRORS: &[&str] = &["overloaded_error", "UNAVAILABLE"];

/// Framer, transformer and client encoder for one upstream response, with an
/// aggregator shadowing everything the client sees.
///
/// When the client speaks the upstream's dialect the SSE messages are
/// forwarded unchanged and only the aggregator sees the transformed events.
pub struct StreamNormalizer {
    decoder: Option<EventStreamDecoder>,
    framer: SseFramer,
    transformer: SseMessageTransformer,
    encoder: Option<ClientStreamEncoder>,
    aggregator: EventAggregator,
    emitted: bool,
}

impl StreamNormalizer {
    pub fn new(
        framing: StreamFraming,
        upstream: ApiFormat,
        client: ApiFormat,
        id: &str,
        model: &str,
    ) -> Self {
        let decoder = match framing {
            StreamFraming::AwsEventStream => Some(EventStreamDecoder::new()),
            StreamFraming::Sse => None,
        };
        let encoder = (upstream != client).then(|| ClientStreamEncoder::new(client, id, model));
        Self {
            decoder,
            framer: SseFramer::new(),
            transformer: SseMessageTransformer::new(upstream, client, id, model),
            encoder,
            aggregator: EventAggregator::new(client),
            emitted: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        let messages = match self.decoder.as_mut() {
            Some(decoder) => {
                let mut messages = Vec::new();
                for message in decoder.push(chunk)? {
                    if let Some(frame) = aws_message_to_sse(&message)? {
                        messages.push(frame);
                    }
                }
                messages
            }
            None => self.framer.push(chunk),
        };

        let mut frames = Vec::new();
        for message in messages {
            frames.extend(self.handle_message(&message)?);
        }
        Ok(frames)
    }

    /// Flushes buffered input and closes the client stream.
    pub fn finish(&mut self) -> Result<Vec<String>, StreamError> {
        let mut frames = Vec::new();
        if self.decoder.is_none()
            && let Some(rest) = self.framer.finish()
        {
            frames.extend(self.handle_message(&rest)?);
        }
        if let Some(encoder) = self.encoder.as_mut() {
            frames.extend(encoder.finish());
        }
        Ok(frames)
    }

    /// Whether anything other than heartbeats has reached the client.
    pub fn has_emitted(&self) -> bool {
        self.emitted
    }

    pub fn aggregator(&self) -> &EventAggregator {
        &self.aggregator
    }

    fn handle_message(&mut self, message: &str) -> Result<Vec<String>, StreamError> {
        if is_comment_only(message) {
            return Ok(Vec::new());
        }
        in_band_error(message)?;

        let mut frames = Vec::new();
        for event in self.transformer.push(message) {
            if let Some(encoder) = self.encoder.as_mut() {
                frames.extend(encoder.encode(&event));
            }
            self.aggregator.add_event(event);
        }
        if self.encoder.is_none() {
            frames.push(format!("{message}\n\n"));
        }
        if !frames.is_empty() {
            self.emitted = true;
        }
        Ok(frames)
    }
}

/// Vendors report some failures as an ordinary stream message.
fn in_band_error(message: &str) -> Result<(), StreamError> {
    let event = ServerSentEvent::parse(message);
    let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
        return Ok(());
    };
    let Some(error) = data.get("error").filter(|error| error.is_object()) else {
        return Ok(());
    };
    if event.event_type.as_deref() != Some("error")
        && (data.get("choices").is_some() || data.get("candidates").is_some())
    {
        return Ok(());
    }

    let kind = ["type", "status", "code"]
        .iter()
        .find_map(|field| error.get(*field).and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if RATE_LIMIT_STREAM_ERRORS.contains(&kind.as_str()) {
        return Err(StreamError::RateLimited(format!("{kind}: {message}")));
    }
    if OVERLOADED_STREAM_ERRORS.contains(&kind.as_str()) {
        return Err(StreamError::Overloaded(format!("{kind}: {message}")));
    }
    Err(StreamError::Upstream { kind, message })
}

#[cfg(test)]
mod tests {
    use keyrelay_protocol::aws_eventstream::encode_message;
    use serde_json::json;

    use super::*;

    fn anthropic_stream() -> String {
        let mut out = String::new();
        out.push_str("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3\",\"content\":[]}}\n\n");
        for text in ["Hello", " world", "!"] {
            out.push_str(&format!(
                "event: content_block_delta\ndata: {}\n\n",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})
            ));
        }
        out.push_str("event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n");
        out.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        out
    }

    #[test]
    fn anthropic_stream_is_reencoded_for_openai_clients() {
        let mut normalizer = StreamNormalizer::new(
            StreamFraming::Sse,
            ApiFormat::AnthropicChat,
            ApiFormat::OpenAI,
            "chatcmpl-1",
            "claude-3",
        );
        let raw = anthropic_stream();
        let (head, tail) = raw.as_bytes().split_at(37);
        let mut frames = normalizer.push(head).unwrap();
        frames.extend(normalizer.push(tail).unwrap());
        frames.extend(normalizer.finish().unwrap());

        assert!(normalizer.has_emitted());
        assert_eq!(normalizer.aggregator().text(), "Hello world!");
        assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
        assert!(frames.iter().all(|frame| frame.starts_with("data: ")));
    }

    #[test]
    fn same_dialect_is_forwarded_verbatim() {
        let mut normalizer = StreamNormalizer::new(
            StreamFraming::Sse,
            ApiFormat::AnthropicChat,
            ApiFormat::AnthropicChat,
            "msg_1",
            "claude-3",
        );
        let raw = anthropic_stream();
        let mut frames = normalizer.push(raw.as_bytes()).unwrap();
        frames.extend(normalizer.finish().unwrap());
        assert_eq!(frames.concat(), raw);
        assert_eq!(normalizer.aggregator().text(), "Hello world!");
    }

    #[test]
    fn overloaded_error_before_output_is_not_a_rate_limit() {
        let mut normalizer = StreamNormalizer::new(
            StreamFraming::Sse,
            ApiFormat::AnthropicChat,
            ApiFormat::OpenAI,
            "id",
            "claude-3",
        );
        let err = normalizer
            .push(b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n")
            .unwrap_err();
        assert!(matches!(err, StreamError::Overloaded(_)));
        assert!(!normalizer.has_emitted());
    }

    #[test]
    fn aws_event_stream_is_decoded_before_framing() {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;

        let mut normalizer = StreamNormalizer::new(
            StreamFraming::AwsEventStream,
            ApiFormat::AnthropicChat,
            ApiFormat::AnthropicChat,
            "msg_1",
            "claude-3",
        );
        let inner = json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}});
        let payload = json!({"bytes": STANDARD.encode(inner.to_string())}).to_string();
        let frame = encode_message(
            &[
                (":message-type", "event"),
                (":event-type", "chunk"),
                (":content-type", "application/json"),
            ],
            payload.as_bytes(),
        );

        let (head, tail) = frame.split_at(10);
        assert!(normalizer.push(head).unwrap().is_empty());
        let frames = normalizer.push(tail).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("event: content_block_delta\ndata: "));
        assert_eq!(normalizer.aggregator().text(), "Hi");

        let throttled = encode_message(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            b"{\"message\":\"slow down\"}",
        );
        assert!(matches!(
            normalizer.push(&throttled),
            Err(StreamError::RateLimited(_))
        ));
    }
}
