use keyrelay_protocol::ChatCompletionChunk;
use serde_json::Value;

use super::{AnthropicTextEvent, StreamEvent, TransformOutput, TransformParams, string_field};
use crate::finish;

/// Text-completion streams: v2 names every event, v1 sends bare cumulative data.
pub fn anthropic_text_to_openai(params: TransformParams<'_>) -> TransformOutput {
    if params.parse().event_type.is_some() {
        anthropic_v2_to_openai(params)
    } else {
        anthropic_v1_to_openai(params)
    }
}

/// Cumulative stream: every event repeats the completion so far.
pub fn anthropic_v1_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return params.unchanged(None);
    };
    let Some(completion) = string_field(&value, "completion") else {
        return params.unchanged(None);
    };

    // A shorter or misaligned completion carries nothing new.
    let delta = completion
        .get(params.last_position..)
        .unwrap_or_default()
        .to_string();
    let chunk = ChatCompletionChunk::new(
        string_field(&value, "log_id").unwrap_or(params.fallback_id),
        string_field(&value, "model").unwrap_or(params.fallback_model),
        Some(delta),
        string_field(&value, "stop_reason").map(finish::from_anthropic),
    );
    TransformOutput {
        position: params.last_position.max(completion.len()),
        event: Some(StreamEvent::OpenAI(chunk)),
    }
}

/// Delta stream: each `completion` event carries only new text.
pub fn anthropic_v2_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    if event.event_type.as_deref() != Some("completion") {
        return params.unchanged(None);
    }
    let Ok(parsed) = serde_json::from_str::<AnthropicTextEvent>(&event.data) else {
        return params.unchanged(None);
    };
    let chunk = ChatCompletionChunk::new(
        non_empty(&parsed.log_id).unwrap_or(params.fallback_id),
        non_empty(&parsed.model).unwrap_or(params.fallback_model),
        Some(parsed.completion),
        parsed.stop_reason.as_deref().map(finish::from_anthropic),
    );
    params.unchanged(Some(StreamEvent::OpenAI(chunk)))
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

enum ChatPiece {
    Text(String),
    Stop(String),
}

fn chat_piece(params: &TransformParams<'_>) -> Option<ChatPiece> {
    let event = params.parse();
    let value: Value = serde_json::from_str(&event.data).ok()?;
    let kind = event
        .event_type
        .as_deref()
        .or_else(|| string_field(&value, "type"))?;

    match kind {
        "content_block_start" => {
            let text = value
                .get("content_block")
                .and_then(|block| string_field(block, "text"))
                .unwrap_or_default();
            if text.is_empty() {
                None
            } else {
                Some(ChatPiece::Text(text.to_string()))
            }
        }
        "content_block_delta" => {
            let delta = value.get("delta")?;
            if string_field(delta, "type") == Some("text_delta") {
                string_field(delta, "text").map(|text| ChatPiece::Text(text.to_string()))
            } else {
                None
            }
        }
        "message_delta" => value
            .get("delta")
            .and_then(|delta| string_field(delta, "stop_reason"))
            .map(|reason| ChatPiece::Stop(reason.to_string())),
        _ => None,
    }
}

/// Messages API stream to canonical chunks. `message_start`, `ping` and the
/// block/message stop events carry nothing the canonical shape needs.
pub fn anthropic_chat_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let chunk = match chat_piece(&params) {
        Some(ChatPiece::Text(text)) => {
            ChatCompletionChunk::new(params.fallback_id, params.fallback_model, Some(text), None)
        }
        Some(ChatPiece::Stop(reason)) => ChatCompletionChunk::new(
            params.fallback_id,
            params.fallback_model,
            None,
            Some(finish::from_anthropic(&reason)),
        ),
        None => return params.unchanged(None),
    };
    params.unchanged(Some(StreamEvent::OpenAI(chunk)))
}

/// Messages API stream to legacy text-completion events, for text clients served
/// by a chat-only upstream.
pub fn anthropic_chat_to_anthropic_v2(params: TransformParams<'_>) -> TransformOutput {
    let event = match chat_piece(&params) {
        Some(ChatPiece::Text(text)) => {
            AnthropicTextEvent::new(text, None, params.fallback_model, params.fallback_id)
        }
        Some(ChatPiece::Stop(reason)) => AnthropicTextEvent::new(
            "",
            Some(finish::to_anthropic_text(&finish::from_anthropic(&reason))),
            params.fallback_model,
            params.fallback_id,
        ),
        None => return params.unchanged(None),
    };
    params.unchanged(Some(StreamEvent::AnthropicV2(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Transformer;

    fn run(transformer: Transformer, data: &str, last_position: usize) -> TransformOutput {
        transformer(TransformParams {
            data,
            last_position,
            index: 0,
            fallback_id: "msg_fallback",
            fallback_model: "claude-3-haiku",
        })
    }

    fn content(output: &TransformOutput) -> String {
        match &output.event {
            Some(StreamEvent::OpenAI(chunk)) => chunk.content().to_string(),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn cumulative_stream_yields_deltas() {
        let frames = [
            r#"data: {"completion":"Hello","stop_reason":null,"model":"claude-v1"}"#,
            r#"data: {"completion":"Hello world","stop_reason":null,"model":"claude-v1"}"#,
            r#"data: {"completion":"Hello world!","stop_reason":"stop_sequence","model":"claude-v1"}"#,
        ];
        let mut position = 0;
        let mut deltas = Vec::new();
        for frame in frames {
            let out = run(anthropic_v1_to_openai, frame, position);
            position = out.position;
            deltas.push(content(&out));
        }
        assert_eq!(deltas, vec!["Hello", " world", "!"]);
        assert_eq!(position, "Hello world!".len());
    }

    #[test]
    fn shorter_cumulative_completion_adds_nothing() {
        let frame = r#"data: {"completion":"Hello","stop_reason":null,"model":"claude-v1"}"#;
        let out = run(anthropic_v1_to_openai, frame, "Hello world".len());
        assert_eq!(content(&out), "");
        assert_eq!(out.position, "Hello world".len());
    }

    #[test]
    fn misaligned_cumulative_position_adds_nothing() {
        let frame = r#"data: {"completion":"héllo","stop_reason":null,"model":"claude-v1"}"#;
        let out = run(anthropic_v1_to_openai, frame, 2);
        assert_eq!(content(&out), "");
        assert_eq!(out.position, "héllo".len());
    }

    #[test]
    fn text_dispatch_detects_stream_version() {
        let v2 = run(
            anthropic_text_to_openai,
            "event: completion\ndata: {\"type\":\"completion\",\"completion\":\" hi\",\"stop_reason\":null,\"model\":\"claude-2\"}",
            7,
        );
        assert_eq!(content(&v2), " hi");
        assert_eq!(v2.position, 7);

        let v1 = run(anthropic_text_to_openai, r#"data: {"completion":"abc"}"#, 1);
        assert_eq!(content(&v1), "bc");
    }

    #[test]
    fn v2_ping_is_ignored() {
        let out = run(anthropic_v2_to_openai, "event: ping\ndata: {}", 0);
        assert_eq!(out.event, None);
    }

    #[test]
    fn chat_deltas_and_stop_reason() {
        let delta = run(
            anthropic_chat_to_openai,
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hey\"}}",
            0,
        );
        assert_eq!(content(&delta), "Hey");

        let stop = run(
            anthropic_chat_to_openai,
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"}}",
            0,
        );
        match stop.event {
            Some(StreamEvent::OpenAI(chunk)) => assert_eq!(chunk.finish_reason(), Some("length")),
            other => panic!("unexpected {other:?}"),
        }

        let start = run(
            anthropic_chat_to_openai,
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}",
            0,
        );
        assert_eq!(start.event, None);
    }

    #[test]
    fn chat_to_text_stays_vendor_internal() {
        let out = run(
            anthropic_chat_to_anthropic_v2,
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Yo\"}}",
            0,
        );
        match out.event {
            Some(StreamEvent::AnthropicV2(event)) => {
                assert_eq!(event.completion, "Yo");
                assert_eq!(event.kind, "completion");
                assert_eq!(event.log_id, "msg_fallback");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
