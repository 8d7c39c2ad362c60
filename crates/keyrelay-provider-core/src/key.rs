use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use keyrelay_common::{ModelFamily, Service};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Credential is dead and needs replacing.
    Revoked,
    /// Credential is valid but out of credit.
    Quota,
}

/// Vendor-specific key metadata, discovered by checkers or parsed from the secret.
#[derive(Clone, PartialEq)]
pub enum VendorMeta {
    OpenAI {
        is_trial: bool,
        organization_id: Option<String>,
        model_snapshots: Vec<String>,
    },
    Anthropic {
        tier: AnthropicTier,
        is_pozzed: bool,
        allows_multimodality: bool,
        requires_preamble: bool,
    },
    GoogleAI {
        billing_enabled: bool,
        model_ids: Vec<String>,
    },
    MistralAI,
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        logging_status: AwsLoggingStatus,
        model_ids: Vec<String>,
    },
    Gcp {
        project_id: String,
        client_email: String,
        region: String,
        private_key: String,
        access_token: Option<String>,
        access_token_expires_at: Option<Instant>,
    },
    Azure {
        resource_name: String,
        deployment_id: String,
    },
}

impl fmt::Debug for VendorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VendorMeta::OpenAI {
                is_trial,
                organization_id,
                model_snapshots,
            } => f
                .debug_struct("OpenAI")
                .field("is_trial", is_trial)
                .field("organization_id", organization_id)
                .field("model_snapshots", model_snapshots)
                .finish(),
            VendorMeta::Anthropic {
                tier,
                is_pozzed,
                allows_multimodality,
                requires_preamble,
            } => f
                .debug_struct("Anthropic")
                .field("tier", tier)
                .field("is_pozzed", is_pozzed)
                .field("allows_multimodality", allows_multimodality)
                .field("requires_preamble", requires_preamble)
                .finish(),
            VendorMeta::GoogleAI {
                billing_enabled,
                model_ids,
            } => f
                .debug_struct("GoogleAI")
                .field("billing_enabled", billing_enabled)
                .field("model_ids", model_ids)
                .finish(),
            VendorMeta::MistralAI => f.write_str("MistralAI"),
            VendorMeta::Aws {
                access_key_id,
                region,
                logging_status,
                model_ids,
                ..
            } => f
                .debug_struct("Aws")
                .field("access_key_id", access_key_id)
                .field("region", region)
                .field("logging_status", logging_status)
                .field("model_ids", model_ids)
                .finish_non_exhaustive(),
            VendorMeta::Gcp {
                project_id,
                client_email,
                region,
                access_token_expires_at,
                ..
            } => f
                .debug_struct("Gcp")
                .field("project_id", project_id)
                .field("client_email", client_email)
                .field("region", region)
                .field("access_token_expires_at", access_token_expires_at)
                .finish_non_exhaustive(),
            VendorMeta::Azure {
                resource_name,
                deployment_id,
            } => f
                .debug_struct("Azure")
                .field("resource_name", resource_name)
                .field("deployment_id", deployment_id)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnthropicTier {
    Unknown,
    Free,
    Build1,
    Build2,
    Build3,
    Build4,
    Scale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwsLoggingStatus {
    Unknown,
    Disabled,
    Enabled,
}

/// One upstream credential. Owned by its provider; everyone else sees clones.
#[derive(Clone)]
pub struct Key {
    pub id: String,
    pub secret: String,
    pub service: Service,
    pub model_families: BTreeSet<ModelFamily>,
    pub enabled: bool,
    pub revoked: bool,
    pub over_quota: bool,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub last_used: Option<Instant>,
    pub last_checked: Option<Instant>,
    pub prompt_count: u64,
    pub usage: BTreeMap<ModelFamily, u64>,
    pub meta: VendorMeta,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("model_families", &self.model_families)
            .field("enabled", &self.enabled)
            .field("revoked", &self.revoked)
            .field("over_quota", &self.over_quota)
            .field("rate_limited_until", &self.rate_limited_until)
            .field("last_used", &self.last_used)
            .field("last_checked", &self.last_checked)
            .field("prompt_count", &self.prompt_count)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Key {
    /// A fresh key serving every family of its vendor until a checker says otherwise.
    pub fn new(service: Service, secret: impl Into<String>, meta: VendorMeta) -> Self {
        let secret = secret.into();
        Self {
            id: key_id(service, &secret),
            secret,
            service,
            model_families: ModelFamily::families_of(service).collect(),
            enabled: true,
            revoked: false,
            over_quota: false,
            rate_limited_at: None,
            rate_limited_until: None,
            last_used: None,
            last_checked: None,
            prompt_count: 0,
            usage: BTreeMap::new(),
            meta,
        }
    }

    pub fn supports(&self, family: ModelFamily) -> bool {
        self.model_families.contains(&family)
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    pub fn remaining_lockout(&self, now: Instant) -> Duration {
        self.rate_limited_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn allows_multimodality(&self) -> bool {
        match &self.meta {
            VendorMeta::Anthropic {
                allows_multimodality,
                ..
            } => *allows_multimodality,
            _ => true,
        }
    }

    pub fn total_usage(&self) -> u64 {
        self.usage.values().sum()
    }
}

/// Stable short identifier derived from the secret; never exposes the secret.
pub fn key_id(service: Service, secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{}-{}", service.as_str(), hex::encode(&digest[..8]))
}

/// Partial update applied by `KeyProvider::update`; `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub model_families: Option<BTreeSet<ModelFamily>>,
    pub last_checked: Option<Instant>,
    pub meta: Option<VendorMeta>,
}

impl KeyUpdate {
    pub fn checked_at(at: Instant) -> Self {
        Self {
            last_checked: Some(at),
            ..Default::default()
        }
    }

    pub fn apply(self, key: &mut Key) {
        if let Some(families) = self.model_families {
            key.model_families = families;
        }
        if let Some(at) = self.last_checked {
            key.last_checked = Some(at);
        }
        if let Some(meta) = self.meta {
            key.meta = meta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_hides_secret() {
        let a = key_id(Service::OpenAI, "sk-secret");
        let b = key_id(Service::OpenAI, "sk-secret");
        assert_eq!(a, b);
        assert!(a.starts_with("openai-"));
        assert!(!a.contains("secret"));
        assert_ne!(a, key_id(Service::OpenAI, "sk-other"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key = Key::new(
            Service::Aws,
            "AKIA:shh:us-east-1",
            VendorMeta::Aws {
                access_key_id: "AKIA".into(),
                secret_access_key: "shh".into(),
                region: "us-east-1".into(),
                logging_status: AwsLoggingStatus::Unknown,
                model_ids: Vec::new(),
            },
        );
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("shh"));
        assert!(key.supports(ModelFamily::AwsClaude));
        assert!(!key.supports(ModelFamily::Claude));
    }
}
