use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ApiFormat, ModelFamily, Service, openai_family};
use keyrelay_provider_core::{
    CheckFailure, Headers, HttpMethod, Key, KeyChecker, KeyPolicy, KeyUpdate, ProxyRequestManager,
    UpstreamClient, VendorMeta, header_get,
};
use serde_json::json;
use tracing::debug;

use super::{ensure_service, families_from_ids, failure_from_status, model_ids, send_check, unique_secrets};
use crate::auth_extractor;
use crate::error::PrepareError;
use crate::vendor::{PrepareContext, VendorAdapter, unsupported};

pub const BASE_URL: &str = "https://api.openai.com";
/// Trial organizations are capped far below paid tiers.
const TRIAL_REQUEST_LIMIT: u64 = 200;

pub fn parse_keys(secrets: &[String]) -> Vec<Key> {
    unique_secrets(secrets)
        .map(|secret| {
            Key::new(
                Service::OpenAI,
                secret,
                VendorMeta::OpenAI {
                    is_trial: false,
                    organization_id: None,
                    model_snapshots: Vec::new(),
                },
            )
        })
        .collect()
}

fn is_trial(key: &Key) -> bool {
    matches!(key.meta, VendorMeta::OpenAI { is_trial: true, .. })
}

/// Parses OpenAI reset durations such as `1s`, `6m0s`, `20ms` or `1h2m3.5s`.
pub fn parse_reset_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'h' => 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * unit);
    }
    number.is_empty().then_some(total)
}

pub struct OpenAIPolicy;

impl KeyPolicy for OpenAIPolicy {
    fn service(&self) -> Service {
        Service::OpenAI
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn prefer(&self, a: &Key, b: &Key) -> Ordering {
        is_trial(a).cmp(&is_trial(b))
    }

    fn rate_limit_hint(&self, headers: &Headers) -> Option<Duration> {
        let exhausted = |name: &str| header_get(headers, name).is_some_and(|v| v.trim() == "0");
        let reset = |name: &str| header_get(headers, name).and_then(parse_reset_duration);
        let requests = exhausted("x-ratelimit-remaining-requests")
            .then(|| reset("x-ratelimit-reset-requests"))
            .flatten();
        let tokens = exhausted("x-ratelimit-remaining-tokens")
            .then(|| reset("x-ratelimit-reset-tokens"))
            .flatten();
        requests.max(tokens)
    }
}

pub struct OpenAIChecker {
    client: Arc<dyn UpstreamClient>,
    base_url: String,
}

impl OpenAIChecker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: Arc<dyn UpstreamClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn auth(key: &Key) -> Headers {
        vec![("authorization".to_string(), format!("Bearer {}", key.secret))]
    }

    /// A request with an invalid `max_tokens` is rejected cheaply but still
    /// reports the organization and its rate limits.
    async fn check_limits(&self, key: &Key) -> Result<(bool, Option<String>), CheckFailure> {
        let mut headers = Self::auth(key);
        headers.push(("content-type".to_string(), "application/json".to_string()));
        let response = self
            .client
            .send(keyrelay_provider_core::UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/v1/chat/completions", self.base_url),
                headers,
                body: Some(
                    json!({
                        "model": "gpt-3.5-turbo",
                        "max_tokens": -1,
                        "messages": [{"role": "user", "content": "hi"}]
                    })
                    .to_string()
                    .into(),
                ),
                is_stream: false,
            })
            .await
            .map_err(|err| CheckFailure::Transient(err.to_string()))?;
        let status = response.status;
        let headers = response.headers.clone();
        let body = response
            .into_bytes()
            .await
            .map_err(|err| CheckFailure::Transient(err.to_string()))?;
        if status != 400 && !(200..300).contains(&status) {
            return Err(failure_from_status(Service::OpenAI, status, &headers, &body));
        }
        let limit = header_get(&headers, "x-ratelimit-limit-requests")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let organization = header_get(&headers, "openai-organization").map(str::to_string);
        Ok((limit.is_some_and(|limit| limit <= TRIAL_REQUEST_LIMIT), organization))
    }
}

#[async_trait]
impl KeyChecker for OpenAIChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        let reply = send_check(
            self.client.as_ref(),
            Service::OpenAI,
            HttpMethod::Get,
            format!("{}/v1/models", self.base_url),
            Self::auth(key),
            None,
        )
        .await?;
        let ids: Vec<String> = model_ids(&reply.body, "data", "id")
            .into_iter()
            .filter(|id| {
                ["gpt-", "o1", "chatgpt-", "dall-e"]
                    .iter()
                    .any(|prefix| id.starts_with(prefix))
            })
            .collect();
        let mut families = families_from_ids(ids.iter().map(String::as_str), openai_family);
        if families.is_empty() {
            families.insert(ModelFamily::Turbo);
        }

        let (is_trial, organization_id) = self.check_limits(key).await?;
        debug!(
            event = "openai_key_checked",
            key_id = %key.id,
            families = families.len(),
            is_trial,
        );
        Ok(KeyUpdate {
            model_families: Some(families),
            last_checked: None,
            meta: Some(VendorMeta::OpenAI {
                is_trial,
                organization_id,
                model_snapshots: ids,
            }),
        })
    }
}

pub struct OpenAIAdapter {
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenAIAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VendorAdapter for OpenAIAdapter {
    fn service(&self) -> Service {
        Service::OpenAI
    }

    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError> {
        ensure_service(key, Service::OpenAI)?;
        let path = match ctx.format {
            ApiFormat::OpenAI => "/v1/chat/completions",
            ApiFormat::OpenAIText => "/v1/completions",
            ApiFormat::OpenAIImage => "/v1/images/generations",
            other => return Err(unsupported(Service::OpenAI, other)),
        };
        auth_extractor::strip_client_auth(request);
        request.set_base_url(self.base_url.clone());
        request.set_path(path);
        auth_extractor::set_bearer(request, &key.secret);
        auth_extractor::set_content_type_json(request);
        if let VendorMeta::OpenAI {
            organization_id: Some(org),
            ..
        } = &key.meta
        {
            auth_extractor::set_header(request, "openai-organization", org);
        }
        if ctx.is_streaming && ctx.format == ApiFormat::OpenAI {
            request.modify_body(|body| {
                body["stream"] = json!(true);
                body["stream_options"] = json!({"include_usage": true});
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_provider_core::{OutboundRequest, header_get};

    use super::*;

    #[test]
    fn reset_durations_parse() {
        assert_eq!(parse_reset_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_reset_duration("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_reset_duration("20ms"), Some(Duration::from_millis(20)));
        assert_eq!(parse_reset_duration("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_reset_duration("7"), None);
        assert_eq!(parse_reset_duration("x"), None);
    }

    #[test]
    fn hint_only_applies_when_exhausted() {
        let headers: Headers = vec![
            ("x-ratelimit-remaining-requests".into(), "0".into()),
            ("x-ratelimit-reset-requests".into(), "6m0s".into()),
            ("x-ratelimit-remaining-tokens".into(), "1000".into()),
            ("x-ratelimit-reset-tokens".into(), "1h".into()),
        ];
        assert_eq!(
            OpenAIPolicy.rate_limit_hint(&headers),
            Some(Duration::from_secs(360))
        );
        let headers: Headers = vec![("x-ratelimit-reset-requests".into(), "1s".into())];
        assert_eq!(OpenAIPolicy.rate_limit_hint(&headers), None);
    }

    #[tokio::test]
    async fn prepare_sets_auth_and_path() {
        let key = parse_keys(&["sk-test".to_string()]).remove(0);
        let mut outbound = OutboundRequest::post("", json!({"model": "gpt-4", "stream": true}));
        outbound.headers.push(("Authorization".into(), "Bearer client".into()));
        let mut manager = ProxyRequestManager::new(&mut outbound);
        OpenAIAdapter::new()
            .prepare(
                &key,
                &PrepareContext {
                    model: "gpt-4",
                    format: ApiFormat::OpenAI,
                    is_streaming: true,
                },
                &mut manager,
            )
            .await
            .unwrap();
        let req = manager.request();
        assert_eq!(req.url(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-test"));
        assert_eq!(req.body["stream_options"]["include_usage"], json!(true));
    }
}
