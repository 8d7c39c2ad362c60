//! Non-streaming bodies: upstream JSON to a neutral completion and back out in
//! the client's dialect.

use keyrelay_common::ApiFormat;
use keyrelay_protocol::canonical::unix_now;
use serde_json::{Value, json};

use crate::error::TransformError;
use crate::finish;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalCompletion {
    pub id: String,
    pub model: String,
    pub text: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

fn str_at<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

impl CanonicalCompletion {
    pub fn from_upstream(format: ApiFormat, body: &Value) -> Result<Self, TransformError> {
        let missing = |field| TransformError::MissingField { format, field };
        let id = str_at(body, "/id").unwrap_or_default().to_string();
        let model = str_at(body, "/model").unwrap_or_default().to_string();

        let completion = match format {
            ApiFormat::OpenAI | ApiFormat::MistralAI => CanonicalCompletion {
                id,
                model,
                text: str_at(body, "/choices/0/message/content")
                    .ok_or_else(|| missing("choices[0].message.content"))?
                    .to_string(),
                finish_reason: str_at(body, "/choices/0/finish_reason").map(str::to_string),
                prompt_tokens: u64_at(body, "/usage/prompt_tokens"),
                output_tokens: u64_at(body, "/usage/completion_tokens"),
            },
            ApiFormat::OpenAIText => CanonicalCompletion {
                id,
                model,
                text: str_at(body, "/choices/0/text")
                    .ok_or_else(|| missing("choices[0].text"))?
                    .to_string(),
                finish_reason: str_at(body, "/choices/0/finish_reason").map(str::to_string),
                prompt_tokens: u64_at(body, "/usage/prompt_tokens"),
                output_tokens: u64_at(body, "/usage/completion_tokens"),
            },
            ApiFormat::AnthropicText => CanonicalCompletion {
                id: str_at(body, "/log_id").map(str::to_string).unwrap_or(id),
                model,
                text: str_at(body, "/completion")
                    .ok_or_else(|| missing("completion"))?
                    .to_string(),
                finish_reason: str_at(body, "/stop_reason").map(finish::from_anthropic),
                prompt_tokens: None,
                output_tokens: None,
            },
            ApiFormat::AnthropicChat => {
                let blocks = body
                    .get("content")
                    .and_then(Value::as_array)
                    .ok_or_else(|| missing("content"))?;
                CanonicalCompletion {
                    id,
                    model,
                    text: blocks
                        .iter()
                        .filter(|block| str_at(block, "/type") == Some("text"))
                        .filter_map(|block| str_at(block, "/text"))
                        .collect(),
                    finish_reason: str_at(body, "/stop_reason").map(finish::from_anthropic),
                    prompt_tokens: u64_at(body, "/usage/input_tokens"),
                    output_tokens: u64_at(body, "/usage/output_tokens"),
                }
            }
            ApiFormat::GoogleAI => {
                let parts = body
                    .pointer("/candidates/0/content/parts")
                    .and_then(Value::as_array)
                    .ok_or_else(|| missing("candidates[0].content.parts"))?;
                CanonicalCompletion {
                    id,
                    model: str_at(body, "/modelVersion").unwrap_or_default().to_string(),
                    text: parts.iter().filter_map(|part| str_at(part, "/text")).collect(),
                    finish_reason: str_at(body, "/candidates/0/finishReason")
                        .map(finish::from_google),
                    prompt_tokens: u64_at(body, "/usageMetadata/promptTokenCount"),
                    output_tokens: u64_at(body, "/usageMetadata/candidatesTokenCount"),
                }
            }
            ApiFormat::MistralText => {
                let text = str_at(body, "/outputs/0/text")
                    .or_else(|| str_at(body, "/choices/0/text"))
                    .or_else(|| str_at(body, "/choices/0/message/content"))
                    .ok_or_else(|| missing("outputs[0].text"))?;
                CanonicalCompletion {
                    id,
                    model,
                    text: text.to_string(),
                    finish_reason: str_at(body, "/outputs/0/stop_reason")
                        .or_else(|| str_at(body, "/choices/0/finish_reason"))
                        .map(str::to_string),
                    prompt_tokens: None,
                    output_tokens: None,
                }
            }
            ApiFormat::OpenAIImage => return Err(TransformError::Unsupported(format)),
        };
        Ok(completion)
    }

    pub fn to_client(&self, format: ApiFormat) -> Result<Value, TransformError> {
        let finish_reason = self.finish_reason.as_deref();
        let prompt = self.prompt_tokens.unwrap_or(0);
        let output = self.output_tokens.unwrap_or(0);
        let body = match format {
            ApiFormat::OpenAI | ApiFormat::MistralAI => json!({
                "id": self.id,
                "object": "chat.completion",
                "created": unix_now(),
                "model": self.model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": self.text},
                    "finish_reason": finish_reason,
                }],
                "usage": {
                    "prompt_tokens": prompt,
                    "completion_tokens": output,
                    "total_tokens": prompt + output,
                },
            }),
            ApiFormat::OpenAIText => json!({
                "id": self.id,
                "object": "text_completion",
                "created": unix_now(),
                "model": self.model,
                "choices": [{
                    "text": self.text,
                    "index": 0,
                    "logprobs": null,
                    "finish_reason": finish_reason,
                }],
            }),
            ApiFormat::AnthropicText => json!({
                "type": "completion",
                "id": self.id,
                "completion": self.text,
                "stop_reason": finish_reason.map(finish::to_anthropic_text),
                "model": self.model,
            }),
            ApiFormat::AnthropicChat => json!({
                "id": self.id,
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": self.text}],
                "model": self.model,
                "stop_reason": finish_reason.map(finish::to_anthropic_chat),
                "stop_sequence": null,
                "usage": {"input_tokens": prompt, "output_tokens": output},
            }),
            ApiFormat::GoogleAI => {
                let mut candidate = json!({
                    "content": {"parts": [{"text": self.text}], "role": "model"},
                    "index": 0,
                });
                if let Some(reason) = finish_reason {
                    candidate["finishReason"] = Value::String(finish::to_google(reason));
                }
                json!({
                    "candidates": [candidate],
                    "usageMetadata": {
                        "promptTokenCount": prompt,
                        "candidatesTokenCount": output,
                        "totalTokenCount": prompt + output,
                    },
                })
            }
            ApiFormat::MistralText => json!({
                "outputs": [{"text": self.text, "stop_reason": finish_reason}],
            }),
            ApiFormat::OpenAIImage => return Err(TransformError::Unsupported(format)),
        };
        Ok(body)
    }
}

/// Converts a blocking upstream body for a client speaking `client`.
/// Same-format bodies are returned untouched.
pub fn convert_blocking(
    upstream: ApiFormat,
    client: ApiFormat,
    body: Value,
) -> Result<Value, TransformError> {
    if upstream == client {
        return Ok(body);
    }
    CanonicalCompletion::from_upstream(upstream, &body)?.to_client(client)
}
