use keyrelay_common::Service;
use keyrelay_provider_core::{DisableReason, Headers, header_get};
use serde_json::Value;

/// What happens to the key that produced an upstream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEffect {
    None,
    RateLimit,
    Disable(DisableReason),
    /// The key lost access to the requested model family only.
    RemoveFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Apply the effect, then put the request back in the queue.
    Retry(KeyEffect),
    /// Surface the error to the client.
    Fail,
}

/// Normalized error body of any vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub action: ErrorAction,
    pub note: Option<String>,
    pub error: VendorError,
}

impl Classification {
    fn retry(effect: KeyEffect, error: VendorError) -> Self {
        Self {
            action: ErrorAction::Retry(effect),
            note: None,
            error,
        }
    }

    fn fail(note: Option<&str>, error: VendorError) -> Self {
        Self {
            action: ErrorAction::Fail,
            note: note.map(str::to_string),
            error,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self.action, ErrorAction::Retry(_))
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
}

/// Pulls `(kind, message)` out of whichever error envelope the vendor uses.
pub fn parse_vendor_error(service: Service, headers: &Headers, body: &[u8]) -> VendorError {
    let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    // Google-style errors sometimes arrive wrapped in a one-element array.
    let parsed = match parsed {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };

    let kind = match service {
        Service::Aws => header_get(headers, "x-amzn-errortype")
            .map(|value| value.split(':').next().unwrap_or(value).to_string())
            .or_else(|| str_at(&parsed, &["__type"]).map(str::to_string)),
        Service::GoogleAI => str_at(&parsed, &["error", "status"]).map(str::to_string),
        Service::MistralAI => str_at(&parsed, &["type"])
            .or_else(|| str_at(&parsed, &["error", "type"]))
            .map(str::to_string),
        _ => str_at(&parsed, &["error", "code"])
            .or_else(|| str_at(&parsed, &["error", "type"]))
            .or_else(|| str_at(&parsed, &["error", "status"]))
            .map(str::to_string),
    };

    let message = str_at(&parsed, &["error", "message"])
        .or_else(|| str_at(&parsed, &["message"]))
        .or_else(|| str_at(&parsed, &["Message"]))
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(512).collect());

    VendorError {
        kind: kind.unwrap_or_default(),
        message,
    }
}

fn anthropic_error_type(error: &VendorError, body: &[u8]) -> String {
    let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    str_at(&parsed, &["error", "type"])
        .map(str::to_string)
        .unwrap_or_else(|| error.kind.clone())
}

/// Decides how a non-2xx upstream response is handled.
pub fn classify(service: Service, status: u16, headers: &Headers, body: &[u8]) -> Classification {
    let error = parse_vendor_error(service, headers, body);
    let message = error.message.to_ascii_lowercase();
    let kind_owned = error.kind.clone();
    let kind = kind_owned.as_str();
    let anthropic_like = matches!(service, Service::Anthropic | Service::Gcp);

    match status {
        400 => {
            if anthropic_like && message.contains("credit balance is too low") {
                Classification::retry(KeyEffect::Disable(DisableReason::Quota), error)
            } else if anthropic_like && message.contains("organization has been disabled") {
                Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
            } else if service == Service::GoogleAI
                && (message.contains("api key not valid") || message.contains("api_key_invalid"))
            {
                Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
            } else if service == Service::Aws && kind == "ValidationException" {
                Classification::fail(
                    Some("The upstream rejected the request as invalid. Check the request parameters."),
                    error,
                )
            } else {
                Classification::fail(None, error)
            }
        }
        401 => Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error),
        403 => match service {
            Service::Anthropic | Service::Gcp if anthropic_error_type(&error, body) == "permission_error" => {
                Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
            }
            Service::Aws if kind == "UnrecognizedClientException" => {
                Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
            }
            Service::Aws if kind == "AccessDeniedException" && message.contains("model") => {
                Classification::retry(KeyEffect::RemoveFamily, error)
            }
            Service::GoogleAI => {
                Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
            }
            _ => Classification::fail(None, error),
        },
        404 => match service {
            Service::OpenAI | Service::Azure if kind == "model_not_found" => Classification::fail(
                Some("The requested model is not available to this proxy's keys."),
                error,
            ),
            Service::Aws if kind == "ResourceNotFoundException" => Classification::fail(
                Some("The requested model is not available in this region."),
                error,
            ),
            _ => Classification::fail(None, error),
        },
        429 => match service {
            Service::OpenAI => match kind {
                "insufficient_quota" => {
                    Classification::retry(KeyEffect::Disable(DisableReason::Quota), error)
                }
                "access_terminated" | "billing_not_active" => {
                    Classification::retry(KeyEffect::Disable(DisableReason::Revoked), error)
                }
                "rate_limit_exceeded" | "requests" | "tokens" => {
                    Classification::retry(KeyEffect::RateLimit, error)
                }
                _ => Classification::fail(
                    Some("Unrecognized rate limit error from OpenAI."),
                    error,
                ),
            },
            Service::Anthropic | Service::Gcp => {
                if anthropic_error_type(&error, body) == "rate_limit_error" || service == Service::Gcp {
                    Classification::retry(KeyEffect::RateLimit, error)
                } else {
                    Classification::fail(
                        Some("The upstream key may be over quota."),
                        error,
                    )
                }
            }
            Service::Aws | Service::GoogleAI | Service::MistralAI | Service::Azure => {
                Classification::retry(KeyEffect::RateLimit, error)
            }
        },
        503 | 529 => {
            let overloaded = match service {
                Service::Aws => {
                    kind == "ServiceUnavailableException" || kind == "ModelNotReadyException"
                }
                Service::Anthropic | Service::Gcp => {
                    anthropic_error_type(&error, body) == "overloaded_error"
                }
                _ => false,
            };
            if overloaded {
                Classification::retry(KeyEffect::None, error)
            } else {
                Classification::fail(Some("Unrecognized error from the upstream service."), error)
            }
        }
        _ => Classification::fail(Some("Unrecognized error from the upstream service."), error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn anthropic_rate_limit_is_retried_with_lockout() {
        let raw = body(serde_json::json!({
            "type": "error",
            "error": {"type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit"}
        }));
        let result = classify(Service::Anthropic, 429, &Vec::new(), &raw);
        assert_eq!(result.action, ErrorAction::Retry(KeyEffect::RateLimit));

        let raw = body(serde_json::json!({
            "type": "error",
            "error": {"type": "api_error", "message": "nope"}
        }));
        let result = classify(Service::Anthropic, 429, &Vec::new(), &raw);
        assert_eq!(result.action, ErrorAction::Fail);
        assert!(result.note.unwrap().contains("over quota"));
    }

    #[test]
    fn openai_quota_and_rate_limits_differ() {
        let quota = body(serde_json::json!({
            "error": {"type": "insufficient_quota", "code": "insufficient_quota", "message": "You exceeded your current quota"}
        }));
        assert_eq!(
            classify(Service::OpenAI, 429, &Vec::new(), &quota).action,
            ErrorAction::Retry(KeyEffect::Disable(DisableReason::Quota))
        );

        let limited = body(serde_json::json!({
            "error": {"type": "requests", "code": "rate_limit_exceeded", "message": "Rate limit reached"}
        }));
        assert_eq!(
            classify(Service::OpenAI, 429, &Vec::new(), &limited).action,
            ErrorAction::Retry(KeyEffect::RateLimit)
        );
    }

    #[test]
    fn aws_uses_error_type_header() {
        let headers = vec![(
            "x-amzn-ErrorType".to_string(),
            "AccessDeniedException:http://internal.amazon.com/coral/com.amazon.bedrock/".to_string(),
        )];
        let raw = body(serde_json::json!({
            "message": "You don't have access to the model with the specified model ID."
        }));
        assert_eq!(
            classify(Service::Aws, 403, &headers, &raw).action,
            ErrorAction::Retry(KeyEffect::RemoveFamily)
        );

        let headers = vec![(
            "x-amzn-errortype".to_string(),
            "ValidationException".to_string(),
        )];
        let result = classify(Service::Aws, 400, &headers, &raw);
        assert_eq!(result.action, ErrorAction::Fail);
        assert!(result.note.is_some());
    }

    #[test]
    fn unauthorized_always_disables() {
        for service in Service::ALL {
            assert_eq!(
                classify(service, 401, &Vec::new(), b"{}").action,
                ErrorAction::Retry(KeyEffect::Disable(DisableReason::Revoked)),
                "{service}"
            );
        }
    }

    #[test]
    fn overloaded_retries_without_marking() {
        let raw = body(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        }));
        assert_eq!(
            classify(Service::Anthropic, 529, &Vec::new(), &raw).action,
            ErrorAction::Retry(KeyEffect::None)
        );
        assert_eq!(
            classify(Service::OpenAI, 500, &Vec::new(), b"oops").error.message,
            "oops"
        );
    }

    #[test]
    fn google_errors_read_status_field() {
        let raw = body(serde_json::json!([{
            "error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}
        }]));
        let result = classify(Service::GoogleAI, 429, &Vec::new(), &raw);
        assert_eq!(result.error.kind, "RESOURCE_EXHAUSTED");
        assert_eq!(result.action, ErrorAction::Retry(KeyEffect::RateLimit));
    }
}
