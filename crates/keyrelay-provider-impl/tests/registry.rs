use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keyrelay_common::{GatewayConfig, ModelFamily, Service};
use keyrelay_provider_core::{
    EventHub, KeyPoolError, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
use keyrelay_provider_impl::{StreamFraming, VendorRegistry};
use tokio::time::{sleep, timeout};

/// Answers every request with the same JSON body and records the URLs it saw.
struct CannedClient {
    body: &'static str,
    seen: Mutex<Vec<String>>,
}

impl CannedClient {
    fn new(body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            body,
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl UpstreamClient for CannedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.seen.lock().unwrap().push(req.url);
        Box::pin(async move {
            Ok(UpstreamHttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Bytes(Bytes::from_static(self.body.as_bytes())),
            })
        })
    }
}

fn config(raw: &str) -> GatewayConfig {
    GatewayConfig::from_json_str(raw).unwrap()
}

#[tokio::test]
async fn only_vendors_with_keys_are_registered() {
    let config = config(
        r#"{"keys": {"openai": ["sk-a", "sk-b", "sk-a"], "aws": ["AKIA:secret:us-west-2"]}}"#,
    );
    let registry =
        VendorRegistry::from_config(&config, CannedClient::new("{}"), EventHub::default()).unwrap();

    assert_eq!(registry.services().collect::<Vec<_>>(), vec![Service::OpenAI, Service::Aws]);
    assert_eq!(registry.pool().available(Some(Service::OpenAI)).await, 2);
    assert_eq!(registry.pool().available(None).await, 3);
    assert!(registry.adapter(Service::Anthropic).is_none());
    assert_eq!(
        registry.adapter(Service::Aws).unwrap().stream_framing(),
        StreamFraming::AwsEventStream
    );
    assert!(matches!(
        registry.pool().get("claude-3-opus-20240229", None, false).await,
        Err(KeyPoolError::ServiceNotConfigured(Service::Anthropic))
    ));
}

#[tokio::test]
async fn malformed_composite_secret_fails_startup() {
    let config = config(r#"{"keys": {"azure": ["just-a-key"]}}"#);
    let result = VendorRegistry::from_config(&config, CannedClient::new("{}"), EventHub::default());
    assert!(matches!(
        result,
        Err(KeyPoolError::InvalidSecret {
            service: Service::Azure,
            ..
        })
    ));
}

#[tokio::test]
async fn disabled_checks_spawn_nothing() {
    let config = config(r#"{"keys": {"mistral_ai": ["m-key"]}, "checks": {"enabled": false}}"#);
    let registry =
        VendorRegistry::from_config(&config, CannedClient::new("{}"), EventHub::default()).unwrap();
    assert!(registry.spawn_checkers(&config.checks).is_empty());
}

#[tokio::test(start_paused = true)]
async fn checker_narrows_families_from_model_list() {
    let client = CannedClient::new(r#"{"data": [{"id": "mistral-large-latest"}, {"id": "mistral-embed"}]}"#);
    let config = config(r#"{"keys": {"mistral_ai": ["m-key"]}}"#);
    let registry =
        VendorRegistry::from_config(&config, client.clone(), EventHub::default()).unwrap();
    let handles = registry.spawn_checkers(&config.checks);
    assert_eq!(handles.len(), 1);

    let checked = timeout(Duration::from_secs(5), async {
        loop {
            let keys = registry.pool().list().await;
            if keys.iter().all(|key| key.last_checked.is_some()) {
                return keys;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let families: Vec<ModelFamily> = checked[0].model_families.iter().copied().collect();
    assert_eq!(families, vec![ModelFamily::MistralLarge]);
    assert_eq!(
        client.seen.lock().unwrap().as_slice(),
        ["https://api.mistral.ai/v1/models".to_string()]
    );
    for handle in handles {
        handle.abort();
    }
}
