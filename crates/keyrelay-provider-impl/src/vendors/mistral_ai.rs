use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ApiFormat, ModelFamily, Service, mistral_family};
use keyrelay_provider_core::{
    CheckFailure, HttpMethod, Key, KeyChecker, KeyPolicy, KeyUpdate, ProxyRequestManager,
    UpstreamClient, VendorMeta,
};

use super::{ensure_service, families_from_ids, model_ids, send_check, unique_secrets};
use crate::auth_extractor;
use crate::error::PrepareError;
use crate::vendor::{PrepareContext, VendorAdapter, unsupported};

pub const BASE_URL: &str = "https://api.mistral.ai";

pub fn parse_keys(secrets: &[String]) -> Vec<Key> {
    unique_secrets(secrets)
        .map(|secret| Key::new(Service::MistralAI, secret, VendorMeta::MistralAI))
        .collect()
}

pub struct MistralAIPolicy;

impl KeyPolicy for MistralAIPolicy {
    fn service(&self) -> Service {
        Service::MistralAI
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_millis(500)
    }
}

pub struct MistralAIChecker {
    client: Arc<dyn UpstreamClient>,
    base_url: String,
}

impl MistralAIChecker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl KeyChecker for MistralAIChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        let reply = send_check(
            self.client.as_ref(),
            Service::MistralAI,
            HttpMethod::Get,
            format!("{}/v1/models", self.base_url),
            vec![("authorization".to_string(), format!("Bearer {}", key.secret))],
            None,
        )
        .await?;
        let ids = model_ids(&reply.body, "data", "id");
        let mut families = families_from_ids(
            ids.iter()
                .map(String::as_str)
                .filter(|id| !id.contains("embed")),
            mistral_family,
        );
        if families.is_empty() {
            families.insert(ModelFamily::MistralSmall);
        }
        Ok(KeyUpdate {
            model_families: Some(families),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct MistralAIAdapter;

#[async_trait]
impl VendorAdapter for MistralAIAdapter {
    fn service(&self) -> Service {
        Service::MistralAI
    }

    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError> {
        ensure_service(key, Service::MistralAI)?;
        let path = match ctx.format {
            ApiFormat::MistralAI => "/v1/chat/completions",
            ApiFormat::MistralText => "/v1/fim/completions",
            other => return Err(unsupported(Service::MistralAI, other)),
        };
        auth_extractor::strip_client_auth(request);
        request.set_base_url(BASE_URL);
        request.set_path(path);
        auth_extractor::set_bearer(request, &key.secret);
        auth_extractor::set_content_type_json(request);
        Ok(())
    }
}
