//! Client request bodies rewritten for an upstream that speaks another dialect.

use keyrelay_common::ApiFormat;
use serde_json::{Map, Value, json};

use crate::error::TransformError;

/// Output cap used when an OpenAI client leaves `max_tokens` unset but the
/// upstream requires one.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

pub fn translate_request(
    client: ApiFormat,
    upstream: ApiFormat,
    body: Value,
) -> Result<Value, TransformError> {
    match (client, upstream) {
        (client, upstream) if client == upstream => Ok(body),
        (ApiFormat::OpenAI, ApiFormat::AnthropicChat) => openai_to_anthropic_chat(&body),
        (ApiFormat::OpenAI, ApiFormat::GoogleAI) => openai_to_google_ai(&body),
        (ApiFormat::OpenAI, ApiFormat::MistralAI) => Ok(body),
        _ => Err(TransformError::UnsupportedRequest { client, upstream }),
    }
}

/// Flattens OpenAI message content (string or part list) into text, keeping
/// image parts aside.
fn content_parts(content: &Value) -> (String, Vec<&Value>) {
    match content {
        Value::String(text) => (text.clone(), Vec::new()),
        Value::Array(parts) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                            text.push_str(chunk);
                        }
                    }
                    Some("image_url") => images.push(part),
                    _ => {}
                }
            }
            (text, images)
        }
        _ => (String::new(), Vec::new()),
    }
}

fn messages(body: &Value) -> Result<&Vec<Value>, TransformError> {
    body.get("messages")
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingField {
            format: ApiFormat::OpenAI,
            field: "messages",
        })
}

/// `data:<mime>;base64,<payload>` image URLs; remote URLs cannot be inlined.
fn inline_image(part: &Value) -> Option<(&str, &str)> {
    let url = part
        .pointer("/image_url/url")
        .and_then(Value::as_str)?
        .strip_prefix("data:")?;
    let (mime, data) = url.split_once(";base64,")?;
    Some((mime, data))
}

fn copy_fields(from: &Value, to: &mut Map<String, Value>, fields: &[(&str, &str)]) {
    for (src, dst) in fields {
        if let Some(value) = from.get(*src) {
            to.insert((*dst).to_string(), value.clone());
        }
    }
}

fn stop_sequences(body: &Value) -> Option<Value> {
    match body.get("stop")? {
        Value::String(stop) => Some(json!([stop])),
        Value::Array(stops) => Some(Value::Array(stops.clone())),
        _ => None,
    }
}

pub fn openai_to_anthropic_chat(body: &Value) -> Result<Value, TransformError> {
    let mut system = Vec::new();
    let mut out_messages: Vec<Value> = Vec::new();

    for message in messages(body)? {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let (text, images) = content_parts(message.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system.push(text);
            continue;
        }
        let role = if role == "assistant" { "assistant" } else { "user" };
        let mut blocks: Vec<Value> = images
            .into_iter()
            .filter_map(inline_image)
            .map(|(mime, data)| {
                json!({"type": "image", "source": {"type": "base64", "media_type": mime, "data": data}})
            })
            .collect();
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
        if blocks.is_empty() {
            continue;
        }
        // Anthropic requires alternating roles; merge consecutive turns.
        match out_messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => out_messages.push(json!({"role": role, "content": blocks})),
        }
    }
    if out_messages.first().is_some_and(|first| first["role"] != "user") {
        out_messages.insert(0, json!({"role": "user", "content": [{"type": "text", "text": "."}]}));
    }

    let mut out = Map::new();
    copy_fields(
        body,
        &mut out,
        &[("model", "model"), ("stream", "stream"), ("temperature", "temperature"), ("top_p", "top_p")],
    );
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".into(), json!(max_tokens));
    out.insert("messages".into(), Value::Array(out_messages));
    if !system.is_empty() {
        out.insert("system".into(), json!(system.join("\n\n")));
    }
    if let Some(stops) = stop_sequences(body) {
        out.insert("stop_sequences".into(), stops);
    }
    Ok(Value::Object(out))
}

pub fn openai_to_google_ai(body: &Value) -> Result<Value, TransformError> {
    let mut system = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in messages(body)? {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let (text, images) = content_parts(message.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system.push(text);
            continue;
        }
        let role = if role == "assistant" { "model" } else { "user" };
        let mut parts: Vec<Value> = images
            .into_iter()
            .filter_map(inline_image)
            .map(|(mime, data)| json!({"inlineData": {"mimeType": mime, "data": data}}))
            .collect();
        if !text.is_empty() {
            parts.push(json!({"text": text}));
        }
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({"role": role, "parts": parts})),
        }
    }

    let mut generation = Map::new();
    copy_fields(
        body,
        &mut generation,
        &[
            ("max_tokens", "maxOutputTokens"),
            ("temperature", "temperature"),
            ("top_p", "topP"),
        ],
    );
    if let Some(stops) = stop_sequences(body) {
        generation.insert("stopSequences".into(), stops);
    }

    let mut out = Map::new();
    copy_fields(body, &mut out, &[("model", "model"), ("stream", "stream")]);
    out.insert("contents".into(), Value::Array(contents));
    out.insert("generationConfig".into(), Value::Object(generation));
    if !system.is_empty() {
        out.insert(
            "systemInstruction".into(),
            json!({"parts": [{"text": system.join("\n\n")}]}),
        );
    }
    Ok(Value::Object(out))
}
