use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_common::{CheckConfig, GatewayConfig, Service};
use keyrelay_provider_core::{
    CheckSchedule, EventHub, Key, KeyChecker, KeyCheckerRunner, KeyPolicy, KeyPool, KeyPoolError,
    KeyStore, UpstreamClient,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::signing::GcpTokenSource;
use crate::vendor::VendorAdapter;
use crate::vendors::{anthropic, aws, azure, gcp, google_ai, mistral_ai, openai};

type SpawnChecker = Box<dyn Fn(CheckSchedule) -> JoinHandle<()> + Send + Sync>;

/// Every configured vendor: its key store (inside the pool), its adapter and
/// the means to start its checker.
pub struct VendorRegistry {
    pool: KeyPool,
    adapters: BTreeMap<Service, Arc<dyn VendorAdapter>>,
    checkers: Vec<(Service, SpawnChecker)>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self {
            pool: KeyPool::new(),
            adapters: BTreeMap::new(),
            checkers: Vec::new(),
        }
    }

    /// Builds stores for each vendor with at least one configured secret.
    pub fn from_config(
        config: &GatewayConfig,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
    ) -> Result<Self, KeyPoolError> {
        let keys = &config.keys;
        let tokens = Arc::new(GcpTokenSource::new(client.clone()));
        let mut registry = Self::new();

        registry.register(
            openai::OpenAIPolicy,
            openai::parse_keys(&keys.openai),
            Arc::new(openai::OpenAIChecker::new(client.clone())),
            Arc::new(openai::OpenAIAdapter::new()),
            &events,
        );
        registry.register(
            anthropic::AnthropicPolicy,
            anthropic::parse_keys(&keys.anthropic),
            Arc::new(anthropic::AnthropicChecker::new(client.clone())),
            Arc::new(anthropic::AnthropicAdapter::new()),
            &events,
        );
        registry.register(
            google_ai::GoogleAIPolicy,
            google_ai::parse_keys(&keys.google_ai),
            Arc::new(google_ai::GoogleAIChecker::new(client.clone())),
            Arc::new(google_ai::GoogleAIAdapter::new()),
            &events,
        );
        registry.register(
            mistral_ai::MistralAIPolicy,
            mistral_ai::parse_keys(&keys.mistral_ai),
            Arc::new(mistral_ai::MistralAIChecker::new(client.clone())),
            Arc::new(mistral_ai::MistralAIAdapter),
            &events,
        );
        registry.register(
            aws::AwsPolicy {
                allow_logging: config.allow_aws_logging,
            },
            aws::parse_keys(&keys.aws)?,
            Arc::new(aws::AwsChecker::new(client.clone())),
            Arc::new(aws::AwsAdapter),
            &events,
        );
        registry.register(
            gcp::GcpPolicy,
            gcp::parse_keys(&keys.gcp)?,
            Arc::new(gcp::GcpChecker::new(tokens.clone())),
            Arc::new(gcp::GcpAdapter::new(tokens)),
            &events,
        );
        registry.register(
            azure::AzurePolicy,
            azure::parse_keys(&keys.azure)?,
            Arc::new(azure::AzureChecker::new(client)),
            Arc::new(azure::AzureAdapter),
            &events,
        );
        Ok(registry)
    }

    /// Adds one vendor. A vendor without keys is left out entirely so the pool
    /// reports it as unconfigured.
    pub fn register<P: KeyPolicy>(
        &mut self,
        policy: P,
        keys: Vec<Key>,
        checker: Arc<dyn KeyChecker>,
        adapter: Arc<dyn VendorAdapter>,
        events: &EventHub,
    ) {
        if keys.is_empty() {
            return;
        }
        let service = policy.service();
        info!(event = "vendor_registered", service = %service, keys = keys.len());
        let store = Arc::new(KeyStore::new(policy, keys, events.clone()));
        self.pool.insert(store.clone());
        self.adapters.insert(service, adapter);

        let events = events.clone();
        self.checkers.push((
            service,
            Box::new(move |schedule| {
                KeyCheckerRunner::new(store.clone(), checker.clone(), schedule, events.clone())
                    .spawn()
            }),
        ));
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    pub fn adapter(&self, service: Service) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(&service).cloned()
    }

    pub fn services(&self) -> impl Iterator<Item = Service> + '_ {
        self.adapters.keys().copied()
    }

    /// Starts one checker task per vendor, or none when checks are disabled.
    pub fn spawn_checkers(&self, config: &CheckConfig) -> Vec<JoinHandle<()>> {
        if !config.enabled {
            info!(event = "key_checks_disabled");
            return Vec::new();
        }
        let schedule = check_schedule(config);
        self.checkers
            .iter()
            .map(|(service, spawn)| {
                info!(event = "key_checker_spawned", service = %service);
                spawn(schedule.clone())
            })
            .collect()
    }
}

impl Default for VendorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn check_schedule(config: &CheckConfig) -> CheckSchedule {
    CheckSchedule {
        recurring: config.recurring,
        check_period: Duration::from_millis(config.period_ms),
        min_check_interval: Duration::from_millis(config.min_interval_ms),
        ..CheckSchedule::default()
    }
}
