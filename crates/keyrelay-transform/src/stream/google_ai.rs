use keyrelay_protocol::ChatCompletionChunk;
use serde_json::Value;

use super::{StreamEvent, TransformOutput, TransformParams, string_field};
use crate::finish;

/// `streamGenerateContent?alt=sse` candidates to canonical chunks.
pub fn google_ai_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return params.unchanged(None);
    };
    let Some(candidate) = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
    else {
        return params.unchanged(None);
    };

    let text: String = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| string_field(part, "text"))
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = string_field(candidate, "finishReason").map(finish::from_google);

    let chunk = ChatCompletionChunk::new(
        params.fallback_id,
        string_field(&value, "modelVersion").unwrap_or(params.fallback_model),
        Some(text),
        finish_reason,
    );
    params.unchanged(Some(StreamEvent::OpenAI(chunk)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_parts_and_maps_finish_reason() {
        let out = google_ai_to_openai(TransformParams {
            data: r#"data: {"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}],"role":"model"},"finishReason":"MAX_TOKENS","index":0}]}"#,
            last_position: 0,
            index: 3,
            fallback_id: "gen-1",
            fallback_model: "gemini-1.5-pro",
        });
        match out.event {
            Some(StreamEvent::OpenAI(chunk)) => {
                assert_eq!(chunk.content(), "ab");
                assert_eq!(chunk.finish_reason(), Some("length"));
                assert_eq!(chunk.model, "gemini-1.5-pro");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prompt_feedback_only_frames_are_skipped() {
        let out = google_ai_to_openai(TransformParams {
            data: r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#,
            last_position: 0,
            index: 0,
            fallback_id: "gen-1",
            fallback_model: "gemini-1.5-pro",
        });
        assert_eq!(out.event, None);
    }
}
