use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ApiFormat, ModelFamily, Service, google_ai_family};
use keyrelay_provider_core::{
    CheckFailure, HttpMethod, Key, KeyChecker, KeyPolicy, KeyUpdate, ProxyRequestManager,
    UpstreamClient, VendorMeta,
};

use super::{ensure_service, families_from_ids, model_ids, send_check, unique_secrets};
use crate::auth_extractor;
use crate::error::PrepareError;
use crate::vendor::{PrepareContext, VendorAdapter, unsupported};

pub const BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub fn parse_keys(secrets: &[String]) -> Vec<Key> {
    unique_secrets(secrets)
        .map(|secret| {
            Key::new(
                Service::GoogleAI,
                secret,
                VendorMeta::GoogleAI {
                    billing_enabled: false,
                    model_ids: Vec::new(),
                },
            )
        })
        .collect()
}

fn billing_enabled(key: &Key) -> bool {
    matches!(
        key.meta,
        VendorMeta::GoogleAI {
            billing_enabled: true,
            ..
        }
    )
}

pub struct GoogleAIPolicy;

impl KeyPolicy for GoogleAIPolicy {
    fn service(&self) -> Service {
        Service::GoogleAI
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn prefer(&self, a: &Key, b: &Key) -> Ordering {
        billing_enabled(b).cmp(&billing_enabled(a))
    }
}

pub struct GoogleAIChecker {
    client: Arc<dyn UpstreamClient>,
    base_url: String,
}

impl GoogleAIChecker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: Arc<dyn UpstreamClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl KeyChecker for GoogleAIChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        let reply = send_check(
            self.client.as_ref(),
            Service::GoogleAI,
            HttpMethod::Get,
            format!("{}/v1beta/models?pageSize=1000", self.base_url),
            vec![("x-goog-api-key".to_string(), key.secret.clone())],
            None,
        )
        .await?;
        let ids: Vec<String> = model_ids(&reply.body, "models", "name")
            .into_iter()
            .map(|name| name.strip_prefix("models/").unwrap_or(&name).to_string())
            .filter(|id| id.contains("gemini"))
            .collect();
        let mut families = families_from_ids(ids.iter().map(String::as_str), google_ai_family);
        if families.is_empty() {
            families.insert(ModelFamily::GeminiPro);
        }
        Ok(KeyUpdate {
            model_families: Some(families),
            meta: Some(VendorMeta::GoogleAI {
                billing_enabled: billing_enabled(key),
                model_ids: ids,
            }),
            ..Default::default()
        })
    }
}

pub struct GoogleAIAdapter {
    base_url: String,
}

impl GoogleAIAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for GoogleAIAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VendorAdapter for GoogleAIAdapter {
    fn service(&self) -> Service {
        Service::GoogleAI
    }

    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError> {
        ensure_service(key, Service::GoogleAI)?;
        if ctx.format != ApiFormat::GoogleAI {
            return Err(unsupported(Service::GoogleAI, ctx.format));
        }
        let action = if ctx.is_streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        auth_extractor::strip_client_auth(request);
        request.set_base_url(self.base_url.clone());
        request.set_path(format!(
            "/v1beta/models/{}:{action}",
            urlencoding::encode(ctx.model)
        ));
        auth_extractor::set_header(request, "x-goog-api-key", &key.secret);
        auth_extractor::set_content_type_json(request);
        // The model lives in the path; Gemini rejects unknown body fields.
        request.modify_body(|body| {
            if let Some(map) = body.as_object_mut() {
                map.remove("model");
                map.remove("stream");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_provider_core::{OutboundRequest, header_get};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn streaming_uses_sse_action() {
        let key = parse_keys(&["AIza-test".to_string()]).remove(0);
        let mut outbound = OutboundRequest::post(
            "",
            json!({"model": "gemini-1.5-pro", "contents": [], "stream": true}),
        );
        let mut manager = ProxyRequestManager::new(&mut outbound);
        GoogleAIAdapter::new()
            .prepare(
                &key,
                &PrepareContext {
                    model: "gemini-1.5-pro",
                    format: ApiFormat::GoogleAI,
                    is_streaming: true,
                },
                &mut manager,
            )
            .await
            .unwrap();
        let req = manager.request();
        assert_eq!(
            req.url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(header_get(&req.headers, "x-goog-api-key"), Some("AIza-test"));
        assert!(req.body.get("model").is_none());
    }

    #[test]
    fn billing_keys_come_first() {
        let plain = parse_keys(&["a".to_string()]).remove(0);
        let mut billed = parse_keys(&["b".to_string()]).remove(0);
        billed.meta = VendorMeta::GoogleAI {
            billing_enabled: true,
            model_ids: Vec::new(),
        };
        assert_eq!(GoogleAIPolicy.prefer(&billed, &plain), Ordering::Less);
    }
}
