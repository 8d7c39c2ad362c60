use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_common::{ModelFamily, Service, service_for_model};

use crate::{DisableReason, Headers, Key, KeyPoolError, KeyProvider, KeyUpdate};

/// Vendor-agnostic façade over every configured `KeyProvider`.
#[derive(Clone, Default)]
pub struct KeyPool {
    providers: BTreeMap<Service, Arc<dyn KeyProvider>>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.insert(provider);
        self
    }

    pub fn insert(&mut self, provider: Arc<dyn KeyProvider>) {
        self.providers.insert(provider.service(), provider);
    }

    pub fn provider(&self, service: Service) -> Option<&Arc<dyn KeyProvider>> {
        self.providers.get(&service)
    }

    pub fn services(&self) -> impl Iterator<Item = Service> + '_ {
        self.providers.keys().copied()
    }

    fn resolve(&self, service: Service) -> Result<&Arc<dyn KeyProvider>, KeyPoolError> {
        self.providers
            .get(&service)
            .ok_or(KeyPoolError::ServiceNotConfigured(service))
    }

    pub fn service_for(&self, model: &str) -> Result<Service, KeyPoolError> {
        service_for_model(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))
    }

    pub async fn get(
        &self,
        model: &str,
        service: Option<Service>,
        needs_multimodal: bool,
    ) -> Result<Key, KeyPoolError> {
        let service = match service {
            Some(service) => service,
            None => self.service_for(model)?,
        };
        self.resolve(service)?.get(model, needs_multimodal).await
    }

    pub async fn list(&self) -> Vec<Key> {
        let mut all = Vec::new();
        for provider in self.providers.values() {
            all.extend(provider.list().await);
        }
        all
    }

    pub async fn disable(&self, key: &Key, reason: DisableReason) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.disable(&key.id, reason).await;
        }
    }

    pub async fn update(&self, key: &Key, update: KeyUpdate) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.update(&key.id, update).await;
        }
    }

    pub async fn mark_rate_limited(&self, key: &Key) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.mark_rate_limited(&key.id).await;
        }
    }

    pub async fn update_rate_limits(&self, key: &Key, headers: &Headers) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.update_rate_limits(&key.id, headers).await;
        }
    }

    pub async fn increment_usage(&self, key: &Key, model: &str, tokens: u64) {
        if let Some(provider) = self.providers.get(&key.service) {
            let family = key.service.family_for(model);
            provider.increment_usage(&key.id, family, tokens).await;
        }
    }

    /// Lockout for the partition `family`. An unconfigured vendor has nothing to
    /// wait for, so it reports zero and the request fails fast on dispatch.
    pub async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        match self.providers.get(&family.service()) {
            Some(provider) => provider.get_lockout_period(family).await,
            None => Duration::ZERO,
        }
    }

    pub async fn available(&self, service: Option<Service>) -> usize {
        let mut total = 0;
        for (svc, provider) in &self.providers {
            if service.is_none_or(|wanted| wanted == *svc) {
                total += provider.available().await;
            }
        }
        total
    }

    pub async fn recheck(&self, service: Service) -> Result<(), KeyPoolError> {
        self.resolve(service)?.recheck().await;
        Ok(())
    }
}
