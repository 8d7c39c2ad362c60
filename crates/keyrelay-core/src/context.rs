//! Inbound routes and the request context built from them.

use keyrelay_common::{ApiFormat, Service};
use keyrelay_provider_core::Headers;
use keyrelay_provider_impl::{count_prompt_tokens, requested_output_tokens};
use keyrelay_transform::translate_request;
use serde_json::Value;

use crate::error::GatewayError;
use crate::job::ProxyContext;

/// What a proxy route accepts and what it sends upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub service: Service,
    pub inbound: ApiFormat,
    pub outbound: ApiFormat,
}

impl RouteSpec {
    pub const fn new(service: Service, inbound: ApiFormat, outbound: ApiFormat) -> Self {
        Self {
            service,
            inbound,
            outbound,
        }
    }

    pub const fn native(service: Service, format: ApiFormat) -> Self {
        Self::new(service, format, format)
    }
}

/// Every proxy endpoint. Google AI routes carry `{model_action}`.
pub const ROUTES: &[(&str, RouteSpec)] = &[
    (
        "/proxy/openai/v1/chat/completions",
        RouteSpec::native(Service::OpenAI, ApiFormat::OpenAI),
    ),
    (
        "/proxy/openai/v1/completions",
        RouteSpec::native(Service::OpenAI, ApiFormat::OpenAIText),
    ),
    (
        "/proxy/openai/v1/images/generations",
        RouteSpec::native(Service::OpenAI, ApiFormat::OpenAIImage),
    ),
    (
        "/proxy/anthropic/v1/messages",
        RouteSpec::native(Service::Anthropic, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/anthropic/v1/complete",
        RouteSpec::native(Service::Anthropic, ApiFormat::AnthropicText),
    ),
    (
        "/proxy/anthropic/v1/chat/completions",
        RouteSpec::new(Service::Anthropic, ApiFormat::OpenAI, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/google-ai/v1beta/models/{model_action}",
        RouteSpec::native(Service::GoogleAI, ApiFormat::GoogleAI),
    ),
    (
        "/proxy/google-ai/v1/chat/completions",
        RouteSpec::new(Service::GoogleAI, ApiFormat::OpenAI, ApiFormat::GoogleAI),
    ),
    (
        "/proxy/mistral-ai/v1/chat/completions",
        RouteSpec::native(Service::MistralAI, ApiFormat::MistralAI),
    ),
    (
        "/proxy/aws/claude/v1/messages",
        RouteSpec::native(Service::Aws, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/aws/claude/v1/complete",
        RouteSpec::native(Service::Aws, ApiFormat::AnthropicText),
    ),
    (
        "/proxy/aws/claude/v1/chat/completions",
        RouteSpec::new(Service::Aws, ApiFormat::OpenAI, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/aws/mistral/v1/chat/completions",
        RouteSpec::native(Service::Aws, ApiFormat::MistralAI),
    ),
    (
        "/proxy/gcp/claude/v1/messages",
        RouteSpec::native(Service::Gcp, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/gcp/claude/v1/chat/completions",
        RouteSpec::new(Service::Gcp, ApiFormat::OpenAI, ApiFormat::AnthropicChat),
    ),
    (
        "/proxy/azure/openai/v1/chat/completions",
        RouteSpec::native(Service::Azure, ApiFormat::OpenAI),
    ),
    (
        "/proxy/azure/openai/v1/images/generations",
        RouteSpec::native(Service::Azure, ApiFormat::OpenAIImage),
    ),
];

/// Client headers that vendors may need to see.
const FORWARDED_HEADERS: &[&str] = &["anthropic-version", "anthropic-beta"];

/// Raw pieces of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub identifier: String,
    pub headers: Headers,
    /// `{model}:{action}` for Google AI routes.
    pub model_action: Option<String>,
    pub body: Vec<u8>,
}

/// Parses and translates an inbound body into a dispatchable context.
pub fn build_context(route: RouteSpec, inbound: InboundRequest) -> Result<ProxyContext, GatewayError> {
    let mut body: Value = serde_json::from_slice(&inbound.body)
        .map_err(|err| GatewayError::BadRequest(format!("invalid JSON body: {err}")))?;
    if !body.is_object() {
        return Err(GatewayError::BadRequest(
            "request body must be a JSON object".to_string(),
        ));
    }

    let (client_model, is_streaming) = match inbound.model_action.as_deref() {
        Some(model_action) => google_model_action(model_action)?,
        None => {
            let model = body
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| default_model(route))
                .ok_or_else(|| GatewayError::BadRequest("missing model".to_string()))?;
            let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
            (model, stream)
        }
    };
    if route.inbound == ApiFormat::OpenAIImage && is_streaming {
        return Err(GatewayError::BadRequest(
            "image generation does not support streaming".to_string(),
        ));
    }

    let model = vendor_model(route.service, &client_model);
    if let Some(map) = body.as_object_mut()
        && map.contains_key("model")
    {
        map.insert("model".to_string(), Value::String(model.clone()));
    }
    let needs_multimodal = has_images(&body);

    let body = translate_request(route.inbound, route.outbound, body)
        .map_err(|err| GatewayError::BadRequest(err.to_string()))?;
    let prompt_tokens = count_prompt_tokens(route.outbound, &model, &body);
    let output_tokens = requested_output_tokens(route.outbound, &body);

    let headers = inbound
        .headers
        .into_iter()
        .filter(|(name, _)| {
            FORWARDED_HEADERS
                .iter()
                .any(|allowed| name.eq_ignore_ascii_case(allowed))
        })
        .collect();

    Ok(ProxyContext {
        request_id: uuid::Uuid::new_v4().to_string(),
        identifier: inbound.identifier,
        service: route.service,
        inbound: route.inbound,
        outbound: route.outbound,
        family: route.service.family_for(&model),
        model,
        is_streaming,
        needs_multimodal,
        prompt_tokens,
        output_tokens,
        headers,
        body,
    })
}

fn google_model_action(model_action: &str) -> Result<(String, bool), GatewayError> {
    let (model, action) = model_action
        .split_once(':')
        .ok_or_else(|| GatewayError::BadRequest(format!("unsupported path {model_action}")))?;
    let streaming = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(GatewayError::BadRequest(format!(
                "unsupported Google AI action {other}"
            )));
        }
    };
    Ok((model.to_string(), streaming))
}

fn default_model(route: RouteSpec) -> Option<String> {
    match route.inbound {
        ApiFormat::OpenAIImage => Some("dall-e-3".to_string()),
        _ => None,
    }
}

/// Maps a client-facing model name to the identifier the vendor expects.
pub fn vendor_model(service: Service, model: &str) -> String {
    let model = model.trim();
    match service {
        Service::Aws => aws_model_id(model),
        Service::Gcp => gcp_model_id(model),
        _ => model.to_string(),
    }
}

fn aws_model_id(model: &str) -> String {
    if model.starts_with("anthropic.") || model.starts_with("mistral.") {
        return model.to_string();
    }
    if model.starts_with("claude-instant") {
        return "anthropic.claude-instant-v1".to_string();
    }
    if model.starts_with("claude-2.1") {
        return "anthropic.claude-v2:1".to_string();
    }
    if model.starts_with("claude-2") {
        return "anthropic.claude-v2".to_string();
    }
    if model.starts_with("claude-") {
        return format!("anthropic.{model}-v1:0");
    }
    if model.contains("mixtral-8x7b") {
        return "mistral.mixtral-8x7b-instruct-v0:1".to_string();
    }
    if model.contains("mistral-7b") {
        return "mistral.mistral-7b-instruct-v0:2".to_string();
    }
    if model.contains("mistral-large") {
        return "mistral.mistral-large-2402-v1:0".to_string();
    }
    if model.contains("mistral-small") {
        return "mistral.mistral-small-2402-v1:0".to_string();
    }
    model.to_string()
}

/// `claude-3-sonnet-20240229` becomes `claude-3-sonnet@20240229`.
fn gcp_model_id(model: &str) -> String {
    if model.contains('@') {
        return model.to_string();
    }
    match model.rsplit_once('-') {
        Some((name, date)) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{name}@{date}")
        }
        _ => model.to_string(),
    }
}

/// Whether any message carries image input.
fn has_images(body: &Value) -> bool {
    match body {
        Value::Object(map) => {
            if map.contains_key("inlineData") || map.contains_key("inline_data") {
                return true;
            }
            if matches!(
                map.get("type").and_then(Value::as_str),
                Some("image" | "image_url")
            ) {
                return true;
            }
            ["messages", "contents", "content", "parts"]
                .iter()
                .filter_map(|field| map.get(*field))
                .any(has_images)
        }
        Value::Array(items) => items.iter().any(has_images),
        _ => false,
    }
}
