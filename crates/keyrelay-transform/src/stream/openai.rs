use keyrelay_protocol::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use serde_json::Value;

use super::{StreamEvent, TransformOutput, TransformParams, string_field};

/// OpenAI-shaped chat chunks (OpenAI, Azure, Mistral chat) need only parsing.
pub fn passthrough_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    if event.data.trim() == "[DONE]" {
        return params.unchanged(None);
    }
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return params.unchanged(None);
    };
    params.unchanged(chat_chunk_from_value(&value, &params).map(StreamEvent::OpenAI))
}

fn chat_chunk_from_value(value: &Value, params: &TransformParams<'_>) -> Option<ChatCompletionChunk> {
    let raw_choices = value.get("choices")?.as_array()?;
    let mut chunk = ChatCompletionChunk::new(
        string_field(value, "id").unwrap_or(params.fallback_id),
        string_field(value, "model").unwrap_or(params.fallback_model),
        None,
        None,
    );
    if let Some(created) = value.get("created").and_then(Value::as_i64) {
        chunk.created = created;
    }
    chunk.choices = raw_choices
        .iter()
        .enumerate()
        .map(|(position, choice)| {
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
            ChunkChoice {
                index: choice
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64) as u32,
                delta: ChunkDelta {
                    role: string_field(&delta, "role").map(str::to_string),
                    content: string_field(&delta, "content").map(str::to_string),
                },
                finish_reason: string_field(choice, "finish_reason").map(str::to_string),
            }
        })
        .collect();
    Some(chunk)
}

/// Legacy `text_completion` chunks become chat chunks carrying the same text.
pub fn openai_text_to_openai_chat(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    if event.data.trim() == "[DONE]" {
        return params.unchanged(None);
    }
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return params.unchanged(None);
    };
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return params.unchanged(None);
    };

    let mut chunk = ChatCompletionChunk::new(
        string_field(&value, "id").unwrap_or(params.fallback_id),
        string_field(&value, "model").unwrap_or(params.fallback_model),
        Some(string_field(choice, "text").unwrap_or_default().to_string()),
        string_field(choice, "finish_reason").map(str::to_string),
    );
    if let Some(created) = value.get("created").and_then(Value::as_i64) {
        chunk.created = created;
    }
    params.unchanged(Some(StreamEvent::OpenAI(chunk)))
}

/// Mistral text completions arrive either as `outputs` (Bedrock) or as
/// text-completion `choices`.
pub fn mistral_text_to_openai(params: TransformParams<'_>) -> TransformOutput {
    let event = params.parse();
    if event.data.trim() == "[DONE]" {
        return params.unchanged(None);
    }
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return params.unchanged(None);
    };

    let first = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned()
    };
    let (text, finish_reason) = if let Some(output) = first("outputs") {
        (
            string_field(&output, "text").map(str::to_string),
            string_field(&output, "stop_reason").map(str::to_string),
        )
    } else if let Some(choice) = first("choices") {
        let text = string_field(&choice, "text")
            .or_else(|| choice.get("delta").and_then(|d| string_field(d, "content")))
            .map(str::to_string);
        (text, string_field(&choice, "finish_reason").map(str::to_string))
    } else {
        return params.unchanged(None);
    };

    let chunk = ChatCompletionChunk::new(
        string_field(&value, "id").unwrap_or(params.fallback_id),
        string_field(&value, "model").unwrap_or(params.fallback_model),
        Some(text.unwrap_or_default()),
        finish_reason,
    );
    params.unchanged(Some(StreamEvent::OpenAI(chunk)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(data: &str) -> TransformParams<'_> {
        TransformParams {
            data,
            last_position: 0,
            index: 0,
            fallback_id: "fallback",
            fallback_model: "fallback-model",
        }
    }

    fn chunk(output: TransformOutput) -> ChatCompletionChunk {
        match output.event {
            Some(StreamEvent::OpenAI(chunk)) => chunk,
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn passes_openai_chunks_through() {
        let out = passthrough_to_openai(params(
            r#"data: {"id":"c1","object":"chat.completion.chunk","created":5,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        ));
        let chunk = chunk(out);
        assert_eq!(chunk.id, "c1");
        assert_eq!(chunk.created, 5);
        assert_eq!(chunk.content(), "Hi");
    }

    #[test]
    fn done_sentinel_yields_nothing() {
        assert_eq!(passthrough_to_openai(params("data: [DONE]")).event, None);
    }

    #[test]
    fn text_completion_becomes_chat_delta() {
        let out = openai_text_to_openai_chat(params(
            r#"data: {"id":"t","object":"text_completion","model":"gpt-3.5-turbo-instruct","choices":[{"text":" there","index":0,"finish_reason":"length"}]}"#,
        ));
        let chunk = chunk(out);
        assert_eq!(chunk.content(), " there");
        assert_eq!(chunk.finish_reason(), Some("length"));
    }

    #[test]
    fn mistral_bedrock_outputs_are_read() {
        let out = mistral_text_to_openai(params(
            r#"event: completion
data: {"outputs":[{"text":"ok","stop_reason":null}]}"#,
        ));
        let chunk = chunk(out);
        assert_eq!(chunk.content(), "ok");
        assert_eq!(chunk.id, "fallback");
    }
}
