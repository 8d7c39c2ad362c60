use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ApiFormat, Service, azure_family};
use keyrelay_provider_core::{
    CheckFailure, HttpMethod, Key, KeyChecker, KeyPolicy, KeyPoolError, KeyUpdate,
    ProxyRequestManager, UpstreamClient, VendorMeta,
};
use serde_json::Value;

use super::{ensure_service, send_check, split_secret, unique_secrets};
use crate::auth_extractor;
use crate::error::PrepareError;
use crate::vendor::{PrepareContext, VendorAdapter, unsupported};

const API_VERSION: &str = "2024-02-01";

/// Parses `resource_name:deployment_id:api_key` secrets.
pub fn parse_keys(secrets: &[String]) -> Result<Vec<Key>, KeyPoolError> {
    unique_secrets(secrets)
        .map(|secret| {
            let parts = split_secret(secret, 3).ok_or(KeyPoolError::InvalidSecret {
                service: Service::Azure,
                reason: "expected resource_name:deployment_id:api_key",
            })?;
            Ok(Key::new(
                Service::Azure,
                secret,
                VendorMeta::Azure {
                    resource_name: parts[0].to_string(),
                    deployment_id: parts[1].to_string(),
                },
            ))
        })
        .collect()
}

struct Deployment<'a> {
    resource_name: &'a str,
    deployment_id: &'a str,
    api_key: &'a str,
}

fn deployment(key: &Key) -> Option<Deployment<'_>> {
    let VendorMeta::Azure {
        resource_name,
        deployment_id,
    } = &key.meta
    else {
        return None;
    };
    let api_key = split_secret(&key.secret, 3)?.pop()?;
    Some(Deployment {
        resource_name,
        deployment_id,
        api_key,
    })
}

impl Deployment<'_> {
    fn base_url(&self) -> String {
        format!("https://{}.openai.azure.com", self.resource_name)
    }
}

pub struct AzurePolicy;

impl KeyPolicy for AzurePolicy {
    fn service(&self) -> Service {
        Service::Azure
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_secs(4)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_millis(250)
    }
}

/// Reads the deployment to learn which model family it serves.
pub struct AzureChecker {
    client: Arc<dyn UpstreamClient>,
}

impl AzureChecker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyChecker for AzureChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        let dep = deployment(key)
            .ok_or_else(|| CheckFailure::Transient("not an azure key".to_string()))?;
        let reply = send_check(
            self.client.as_ref(),
            Service::Azure,
            HttpMethod::Get,
            format!(
                "{}/openai/deployments/{}?api-version=2022-12-01",
                dep.base_url(),
                dep.deployment_id
            ),
            vec![("api-key".to_string(), dep.api_key.to_string())],
            None,
        )
        .await
        .map_err(|failure| match failure {
            // A deleted deployment will never come back.
            CheckFailure::Transient(message) if message.starts_with("status 404") => {
                CheckFailure::Revoked(message)
            }
            other => other,
        })?;
        let model = reply
            .body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| CheckFailure::Transient("deployment has no model".to_string()))?;
        Ok(KeyUpdate {
            model_families: Some([azure_family(model)].into_iter().collect()),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct AzureAdapter;

#[async_trait]
impl VendorAdapter for AzureAdapter {
    fn service(&self) -> Service {
        Service::Azure
    }

    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError> {
        ensure_service(key, Service::Azure)?;
        let dep = deployment(key).ok_or(PrepareError::WrongKey(Service::Azure))?;
        let operation = match ctx.format {
            ApiFormat::OpenAI => "chat/completions",
            ApiFormat::OpenAIImage => "images/generations",
            other => return Err(unsupported(Service::Azure, other)),
        };
        auth_extractor::strip_client_auth(request);
        request.set_base_url(dep.base_url());
        request.set_path(format!(
            "/openai/deployments/{}/{operation}?api-version={API_VERSION}",
            dep.deployment_id
        ));
        auth_extractor::set_header(request, "api-key", dep.api_key);
        auth_extractor::set_content_type_json(request);
        request.modify_body(|body| {
            if let Some(map) = body.as_object_mut() {
                map.remove("model");
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
    async fn prepare_targets_deployment() {
        let key = parse_keys(&["myres:gpt4dep:abc123".to_string()])
            .unwrap()
            .remove(0);
        let mut outbound = OutboundRequest::post("", json!({"model": "azure-gpt-4", "messages": []}));
        let mut manager = ProxyRequestManager::new(&mut outbound);
        AzureAdapter
            .prepare(
                &key,
                &PrepareContext {
                    model: "azure-gpt-4",
                    format: ApiFormat::OpenAI,
                    is_streaming: false,
                },
                &mut manager,
            )
            .await
            .unwrap();
        let req = manager.request();
        assert_eq!(
            req.url(),
            "https://myres.openai.azure.com/openai/deployments/gpt4dep/chat/completions?api-version=2024-02-01"
        );
        assert_eq!(header_get(&req.headers, "api-key"), Some("abc123"));
        assert!(req.body.get("model").is_none());
    }
}
