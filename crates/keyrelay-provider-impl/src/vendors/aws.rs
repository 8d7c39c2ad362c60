use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keyrelay_common::{ApiFormat, ModelFamily, Service, aws_family};
use keyrelay_provider_core::{
    AwsLoggingStatus, CheckFailure, Headers, HttpMethod, Key, KeyChecker, KeyPolicy, KeyPoolError,
    KeyUpdate, ProxyRequestManager, SignedRequest, UpstreamClient, VendorMeta,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{ensure_service, families_from_ids, model_ids, send_check, split_secret, unique_secrets};
use crate::error::{PrepareError, SigningError};
use crate::signing::AwsSigner;
use crate::vendor::{PrepareContext, StreamFraming, VendorAdapter, unsupported};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Parses `access_key_id:secret_access_key:region` secrets.
pub fn parse_keys(secrets: &[String]) -> Result<Vec<Key>, KeyPoolError> {
    unique_secrets(secrets)
        .map(|secret| {
            let parts = split_secret(secret, 3).ok_or(KeyPoolError::InvalidSecret {
                service: Service::Aws,
                reason: "expected access_key_id:secret_access_key:region",
            })?;
            Ok(Key::new(
                Service::Aws,
                secret,
                VendorMeta::Aws {
                    access_key_id: parts[0].to_string(),
                    secret_access_key: parts[1].to_string(),
                    region: parts[2].to_string(),
                    logging_status: AwsLoggingStatus::Unknown,
                    model_ids: Vec::new(),
                },
            ))
        })
        .collect()
}

struct Credentials<'a> {
    access_key_id: &'a str,
    secret_access_key: &'a str,
    region: &'a str,
}

fn credentials(key: &Key) -> Option<Credentials<'_>> {
    match &key.meta {
        VendorMeta::Aws {
            access_key_id,
            secret_access_key,
            region,
            ..
        } => Some(Credentials {
            access_key_id,
            secret_access_key,
            region,
        }),
        _ => None,
    }
}

impl Credentials<'_> {
    fn signer(&self) -> AwsSigner<'_> {
        AwsSigner {
            access_key_id: self.access_key_id,
            secret_access_key: self.secret_access_key,
            region: self.region,
            service: "bedrock",
        }
    }
}

fn logging_status(key: &Key) -> AwsLoggingStatus {
    match &key.meta {
        VendorMeta::Aws { logging_status, .. } => *logging_status,
        _ => AwsLoggingStatus::Unknown,
    }
}

fn logging_rank(status: AwsLoggingStatus) -> u8 {
    match status {
        AwsLoggingStatus::Disabled => 0,
        AwsLoggingStatus::Unknown => 1,
        AwsLoggingStatus::Enabled => 2,
    }
}

pub struct AwsPolicy {
    /// Permit keys whose account records prompts.
    pub allow_logging: bool,
}

impl KeyPolicy for AwsPolicy {
    fn service(&self) -> Service {
        Service::Aws
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_secs(4)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_millis(250)
    }

    fn is_eligible(&self, key: &Key, family: ModelFamily, needs_multimodal: bool) -> bool {
        key.supports(family)
            && (!needs_multimodal || key.allows_multimodality())
            && (self.allow_logging || logging_status(key) != AwsLoggingStatus::Enabled)
    }

    fn prefer(&self, a: &Key, b: &Key) -> Ordering {
        logging_rank(logging_status(a)).cmp(&logging_rank(logging_status(b)))
    }
}

fn sign_request(
    creds: &Credentials<'_>,
    method: HttpMethod,
    url: &str,
    mut headers: Headers,
    body: &[u8],
) -> Result<Headers, SigningError> {
    creds
        .signer()
        .sign(method, url, &mut headers, body, OffsetDateTime::now_utc())?;
    Ok(headers)
}

pub struct AwsChecker {
    client: Arc<dyn UpstreamClient>,
}

impl AwsChecker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }

    async fn signed_get(&self, creds: &Credentials<'_>, path: &str) -> Result<Value, CheckFailure> {
        let url = format!("https://bedrock.{}.amazonaws.com{path}", creds.region);
        let headers = sign_request(
            creds,
            HttpMethod::Get,
            &url,
            vec![("accept".to_string(), "application/json".to_string())],
            b"",
        )
        .map_err(|err| CheckFailure::Transient(err.to_string()))?;
        let reply = send_check(self.client.as_ref(), Service::Aws, HttpMethod::Get, url, headers, None).await?;
        Ok(reply.body)
    }
}

/// Whether the account's invocation logging captures prompt text.
pub fn logging_from_config(body: &Value) -> AwsLoggingStatus {
    match body.get("loggingConfig") {
        None | Some(Value::Null) => AwsLoggingStatus::Disabled,
        Some(config) => {
            let text = config
                .get("textDataDeliveryEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if text {
                AwsLoggingStatus::Enabled
            } else {
                AwsLoggingStatus::Disabled
            }
        }
    }
}

#[async_trait]
impl KeyChecker for AwsChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        let creds = credentials(key)
            .ok_or_else(|| CheckFailure::Transient("not an aws key".to_string()))?;
        let models = self
            .signed_get(&creds, "/foundation-models?byOutputModality=TEXT")
            .await?;
        let ids: Vec<String> = model_ids(&models, "modelSummaries", "modelId")
            .into_iter()
            .filter(|id| id.starts_with("anthropic.") || id.starts_with("mistral."))
            .collect();
        let families = families_from_ids(ids.iter().map(String::as_str), aws_family);

        let logging_status = match self.signed_get(&creds, "/logging/modelinvocations").await {
            Ok(body) => logging_from_config(&body),
            Err(err) => {
                warn!(event = "aws_logging_check_failed", key_id = %key.id, error = %err);
                AwsLoggingStatus::Unknown
            }
        };
        debug!(event = "aws_key_checked", key_id = %key.id, models = ids.len(), logging = ?logging_status);

        Ok(KeyUpdate {
            model_families: (!families.is_empty()).then_some(families),
            meta: Some(VendorMeta::Aws {
                access_key_id: creds.access_key_id.to_string(),
                secret_access_key: creds.secret_access_key.to_string(),
                region: creds.region.to_string(),
                logging_status,
                model_ids: ids,
            }),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct AwsAdapter;

#[async_trait]
impl VendorAdapter for AwsAdapter {
    fn service(&self) -> Service {
        Service::Aws
    }

    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError> {
        ensure_service(key, Service::Aws)?;
        let creds = credentials(key).ok_or(PrepareError::WrongKey(Service::Aws))?;
        let is_claude = match ctx.format {
            ApiFormat::AnthropicChat | ApiFormat::AnthropicText => true,
            ApiFormat::MistralAI | ApiFormat::MistralText => false,
            other => return Err(unsupported(Service::Aws, other)),
        };
        let chat = ctx.format == ApiFormat::AnthropicChat;
        request.modify_body(|body| {
            if let Some(map) = body.as_object_mut() {
                map.remove("model");
                map.remove("stream");
                if is_claude && chat {
                    map.insert("anthropic_version".into(), json!(BEDROCK_ANTHROPIC_VERSION));
                }
            }
        });

        let action = if ctx.is_streaming {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        let host = format!("https://bedrock-runtime.{}.amazonaws.com", creds.region);
        let path = format!("/model/{}/{action}", urlencoding::encode(ctx.model));
        request.set_base_url(host.clone());
        request.set_path(path.clone());

        let url = format!("{host}{path}");
        let body = Bytes::from(request.request().body.to_string());
        let accept = if ctx.is_streaming {
            "application/vnd.amazon.eventstream"
        } else {
            "application/json"
        };
        let headers = sign_request(
            &creds,
            HttpMethod::Post,
            &url,
            vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("accept".to_string(), accept.to_string()),
            ],
            &body,
        )?;
        request.set_signed_request(SignedRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body,
        });
        Ok(())
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::AwsEventStream
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_provider_core::{OutboundRequest, header_get};

    use super::*;

    fn key(logging: AwsLoggingStatus) -> Key {
        let mut key = parse_keys(&[format!("AKIA{logging:?}:secret:us-east-1")])
            .unwrap()
            .remove(0);
        if let VendorMeta::Aws { logging_status, .. } = &mut key.meta {
            *logging_status = logging;
        }
        key
    }

    #[test]
    fn malformed_secret_is_rejected() {
        assert!(parse_keys(&["AKIA:secret".to_string()]).is_err());
    }

    #[test]
    fn logged_keys_need_permission() {
        let logged = key(AwsLoggingStatus::Enabled);
        let strict = AwsPolicy { allow_logging: false };
        let lax = AwsPolicy { allow_logging: true };
        assert!(!strict.is_eligible(&logged, ModelFamily::AwsClaude, false));
        assert!(lax.is_eligible(&logged, ModelFamily::AwsClaude, false));
        let clean = key(AwsLoggingStatus::Disabled);
        assert_eq!(lax.prefer(&clean, &logged), Ordering::Less);
    }

    #[test]
    fn logging_config_is_read() {
        assert_eq!(logging_from_config(&json!({})), AwsLoggingStatus::Disabled);
        assert_eq!(
            logging_from_config(&json!({"loggingConfig": {"textDataDeliveryEnabled": true}})),
            AwsLoggingStatus::Enabled
        );
    }

    #[tokio::test]
    async fn prepare_signs_invoke_request() {
        let key = key(AwsLoggingStatus::Disabled);
        let mut outbound = OutboundRequest::post(
            "/v1/messages",
            json!({"model": "anthropic.claude-3-sonnet-20240229-v1:0", "stream": true, "messages": []}),
        );
        let original = outbound.clone();
        let mut manager = ProxyRequestManager::new(&mut outbound);
        AwsAdapter
            .prepare(
                &key,
                &PrepareContext {
                    model: "anthropic.claude-3-sonnet-20240229-v1:0",
                    format: ApiFormat::AnthropicChat,
                    is_streaming: true,
                },
                &mut manager,
            )
            .await
            .unwrap();
        let http = manager.request().into_http(true);
        assert_eq!(
            http.url,
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-sonnet-20240229-v1%3A0/invoke-with-response-stream"
        );
        assert!(
            header_get(&http.headers, "authorization")
                .unwrap()
                .starts_with("AWS4-HMAC-SHA256 Credential=AKIADisabled/")
        );
        let sent: Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(sent["anthropic_version"], json!(BEDROCK_ANTHROPIC_VERSION));
        assert!(sent.get("model").is_none());

        manager.revert();
        assert_eq!(outbound, original);
    }
}
