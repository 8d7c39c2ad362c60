use bytes::Bytes;
use http::StatusCode;
use keyrelay_common::{ApiFormat, ModelFamily};
use keyrelay_protocol::sse::OPENAI_DONE_FRAME;
use keyrelay_protocol::{ChatCompletionChunk, encode_sse};
use keyrelay_provider_core::UpstreamTransportErrorKind;
use serde_json::{Value, json};

use crate::response::ProxyResponse;

/// Every way a proxied request can end without a successful upstream reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("{identifier} already has {limit} request(s) queued or in flight")]
    ConcurrencyLimit { identifier: String, limit: usize },
    #[error("the proxy is under heavy load; enable streaming to wait in the queue")]
    Admission,
    /// Internal: the job goes back into the queue instead of reaching the client.
    #[error("upstream asked to retry: {0}")]
    Retryable(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("no keys available for {family}")]
    NoKeysAvailable { family: ModelFamily, over_quota: bool },
    #[error("upstream returned {status}")]
    Upstream {
        status: u16,
        payload: Value,
        note: Option<String>,
    },
    #[error("network error talking to upstream: {message}")]
    Network {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    #[error("request waited too long in the queue")]
    QueueTimeout,
    #[error("failed to prepare upstream request: {0}")]
    Preparation(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ConcurrencyLimit { .. } | GatewayError::Admission => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoKeysAvailable {
                over_quota: true, ..
            } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::NoKeysAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Network {
                kind: UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Network { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Retryable(_)
            | GatewayError::QueueTimeout
            | GatewayError::Preparation(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::ConcurrencyLimit { .. } => "proxy_concurrency_limit",
            GatewayError::Admission => "proxy_too_busy",
            GatewayError::Retryable(_) => "proxy_retry_failed",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::NoKeysAvailable { .. } => "proxy_no_keys_available",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Network { .. } => "proxy_network_error",
            GatewayError::QueueTimeout => "proxy_queue_timeout",
            GatewayError::Preparation(_) => "proxy_preparation_error",
            GatewayError::Internal(_) => "proxy_internal_error",
        }
    }

    /// Human readable message; for upstream errors the vendor's own message.
    pub fn message(&self) -> String {
        match self {
            GatewayError::Upstream {
                status, payload, ..
            } => upstream_message(payload).unwrap_or_else(|| format!("upstream returned {status}")),
            other => other.to_string(),
        }
    }

    pub fn note(&self) -> Option<String> {
        match self {
            GatewayError::Upstream { note, .. } => note.clone(),
            GatewayError::Network { .. } => Some(
                "The proxy could not reach the upstream service. Try again in a moment."
                    .to_string(),
            ),
            GatewayError::NoKeysAvailable {
                over_quota: true, ..
            } => Some("Every key for this model is out of quota.".to_string()),
            GatewayError::QueueTimeout => Some(
                "Your request was queued for too long and was cancelled. Try again later."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Error envelope in the dialect `format` clients expect.
    pub fn to_body(&self, format: ApiFormat) -> Value {
        let kind = self.error_type();
        let message = self.message();
        let note = self.note();
        match format {
            ApiFormat::AnthropicChat | ApiFormat::AnthropicText => json!({
                "type": "error",
                "error": {"type": kind, "message": message, "proxy_note": note},
            }),
            ApiFormat::GoogleAI => json!({
                "error": {
                    "code": self.status().as_u16(),
                    "message": message,
                    "status": google_status(self.status()),
                    "details": [{"reason": kind, "proxy_note": note}],
                },
            }),
            ApiFormat::OpenAI
            | ApiFormat::OpenAIText
            | ApiFormat::OpenAIImage
            | ApiFormat::MistralAI
            | ApiFormat::MistralText => {
                let mut body = json!({
                    "error": {"type": kind, "message": message, "proxy_note": note},
                });
                if let GatewayError::Upstream { payload, .. } = self {
                    body["error"]["upstream"] = payload.clone();
                }
                body
            }
        }
    }

    pub fn into_response(self, format: ApiFormat) -> ProxyResponse {
        ProxyResponse::json(self.status(), &self.to_body(format))
    }

    /// Terminal SSE frames reporting this error inside an already started stream.
    pub fn to_stream_frames(&self, format: ApiFormat, model: &str) -> Vec<String> {
        let text = match self.note() {
            Some(note) => format!("[{}] {}\n{}", self.error_type(), self.message(), note),
            None => format!("[{}] {}", self.error_type(), self.message()),
        };
        match format {
            ApiFormat::AnthropicChat => vec![encode_sse(Some("error"), &self.to_body(format).to_string())],
            ApiFormat::AnthropicText => {
                let event = json!({
                    "type": "completion",
                    "completion": text,
                    "stop_reason": "stop_sequence",
                    "model": model,
                });
                vec![encode_sse(Some("completion"), &event.to_string())]
            }
            ApiFormat::GoogleAI => {
                let event = json!({
                    "candidates": [{
                        "content": {"parts": [{"text": text}], "role": "model"},
                        "finishReason": "STOP",
                        "index": 0,
                    }],
                });
                vec![encode_sse(None, &event.to_string())]
            }
            ApiFormat::OpenAIText => {
                let event = json!({
                    "id": "keyrelay-error",
                    "object": "text_completion",
                    "model": model,
                    "choices": [{"text": text, "index": 0, "finish_reason": "stop"}],
                });
                vec![encode_sse(None, &event.to_string()), OPENAI_DONE_FRAME.to_string()]
            }
            ApiFormat::OpenAI
            | ApiFormat::OpenAIImage
            | ApiFormat::MistralAI
            | ApiFormat::MistralText => {
                let chunk = ChatCompletionChunk::new(
                    "keyrelay-error",
                    model,
                    Some(text),
                    Some("stop".to_string()),
                );
                let data = serde_json::to_string(&chunk).unwrap_or_default();
                vec![encode_sse(None, &data), OPENAI_DONE_FRAME.to_string()]
            }
        }
    }

    pub fn to_stream_bytes(&self, format: ApiFormat, model: &str) -> Bytes {
        Bytes::from(self.to_stream_frames(format, model).concat())
    }
}

fn upstream_message(payload: &Value) -> Option<String> {
    let error = payload.get("error").unwrap_or(payload);
    error
        .get("message")
        .or_else(|| error.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| payload.as_str().map(str::to_string))
}

fn google_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        402 | 429 => "RESOURCE_EXHAUSTED",
        404 => "NOT_FOUND",
        502 | 503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}
