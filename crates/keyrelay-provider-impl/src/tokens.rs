use std::sync::OnceLock;

use keyrelay_common::{ApiFormat, Service, service_for_model};
use serde_json::Value;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn bpe_for(model: &str) -> Option<&'static CoreBPE> {
    if model.contains("gpt-4o") || model.starts_with("o1") {
        O200K.get_or_init(|| o200k_base().ok()).as_ref()
    } else {
        CL100K.get_or_init(|| cl100k_base().ok()).as_ref()
    }
}

/// Token count of `text` for `model`: exact for OpenAI models, chars/4 elsewhere.
pub fn count_text_tokens(model: &str, text: &str) -> u64 {
    let openai = matches!(
        service_for_model(model),
        Some(Service::OpenAI | Service::Azure)
    );
    if openai && let Some(bpe) = bpe_for(model.strip_prefix("azure-").unwrap_or(model)) {
        return bpe.encode_ordinary(text).len() as u64;
    }
    (text.chars().count() as u64).div_ceil(4)
}

fn push_content(out: &mut String, content: &Value) {
    match content {
        Value::String(text) => {
            out.push_str(text);
            out.push('\n');
        }
        Value::Array(parts) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                    out.push('\n');
                }
            }
        }
        _ => {}
    }
}

/// Concatenated prompt text of a request body in `format`.
pub fn prompt_text(format: ApiFormat, body: &Value) -> String {
    let mut out = String::new();
    match format {
        ApiFormat::OpenAI | ApiFormat::MistralAI | ApiFormat::AnthropicChat => {
            if let Some(system) = body.get("system") {
                push_content(&mut out, system);
            }
            for message in body
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(content) = message.get("content") {
                    push_content(&mut out, content);
                }
            }
        }
        ApiFormat::OpenAIText
        | ApiFormat::OpenAIImage
        | ApiFormat::AnthropicText
        | ApiFormat::MistralText => {
            if let Some(prompt) = body.get("prompt") {
                push_content(&mut out, prompt);
            }
        }
        ApiFormat::GoogleAI => {
            let contents = body.get("contents").and_then(Value::as_array);
            let system = body.get("systemInstruction").into_iter();
            for item in system.chain(contents.into_iter().flatten()) {
                if let Some(parts) = item.get("parts") {
                    push_content(&mut out, parts);
                }
            }
        }
    }
    out
}

pub fn count_prompt_tokens(format: ApiFormat, model: &str, body: &Value) -> u64 {
    count_text_tokens(model, &prompt_text(format, body))
}

/// Requested output budget, used to weigh queue fairness.
pub fn requested_output_tokens(format: ApiFormat, body: &Value) -> u64 {
    let field = match format {
        ApiFormat::AnthropicText => body.get("max_tokens_to_sample"),
        ApiFormat::GoogleAI => body
            .get("generationConfig")
            .and_then(|config| config.get("maxOutputTokens")),
        _ => body.get("max_tokens").or_else(|| body.get("max_completion_tokens")),
    };
    field.and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn collects_prompt_text_across_formats() {
        let chat = json!({
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "user", "content": [{"type": "text", "text": "world"}, {"type": "image_url"}]}
            ]
        });
        assert_eq!(prompt_text(ApiFormat::AnthropicChat, &chat), "be brief\nhello\nworld\n");

        let google = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        assert_eq!(prompt_text(ApiFormat::GoogleAI, &google), "hi\n");
    }

    #[test]
    fn non_openai_models_use_character_estimate() {
        assert_eq!(count_text_tokens("claude-3-opus-20240229", "abcdefgh"), 2);
        assert_eq!(count_text_tokens("gemini-pro", "abc"), 1);
        assert!(count_text_tokens("gpt-4", "hello world") >= 2);
    }

    #[test]
    fn output_budget_reads_vendor_field() {
        assert_eq!(
            requested_output_tokens(ApiFormat::AnthropicText, &json!({"max_tokens_to_sample": 300})),
            300
        );
        assert_eq!(
            requested_output_tokens(
                ApiFormat::GoogleAI,
                &json!({"generationConfig": {"maxOutputTokens": 64}})
            ),
            64
        );
        assert_eq!(requested_output_tokens(ApiFormat::OpenAI, &json!({})), 0);
    }
}
