use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keyrelay_common::{ModelFamily, Service};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::events::{Event, KeyDisabledEvent, KeyRateLimitedEvent};
use crate::{DisableReason, EventHub, Headers, Key, KeyPoolError, KeyUpdate};

/// Per-vendor key list with its selection and rate-limit bookkeeping.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn service(&self) -> Service;

    /// Snapshot of every key, disabled ones included.
    async fn list(&self) -> Vec<Key>;

    /// Selects the best key for `model` and throttles it briefly.
    async fn get(&self, model: &str, needs_multimodal: bool) -> Result<Key, KeyPoolError>;

    async fn disable(&self, key_id: &str, reason: DisableReason);

    async fn update(&self, key_id: &str, update: KeyUpdate);

    /// Number of enabled keys.
    async fn available(&self) -> usize;

    async fn increment_usage(&self, key_id: &str, family: ModelFamily, tokens: u64);

    /// Zero when a dequeue for `family` could get a key right now.
    async fn get_lockout_period(&self, family: ModelFamily) -> Duration;

    async fn mark_rate_limited(&self, key_id: &str);

    /// Applies rate-limit hints from upstream response headers.
    async fn update_rate_limits(&self, key_id: &str, headers: &Headers);

    /// Forgets every enabled key's check state so the checker visits them again.
    async fn recheck(&self);
}

/// The vendor-specific half of a provider: tunables and selection heuristics.
pub trait KeyPolicy: Send + Sync + 'static {
    fn service(&self) -> Service;

    /// How long a key stays locked after an upstream 429.
    fn rate_limit_lockout(&self) -> Duration;

    /// Throttle window applied to a key right after it is handed out.
    fn key_reuse_delay(&self) -> Duration;

    fn family_for_model(&self, model: &str) -> ModelFamily {
        self.service().family_for(model)
    }

    fn is_eligible(&self, key: &Key, family: ModelFamily, needs_multimodal: bool) -> bool {
        key.supports(family) && (!needs_multimodal || key.allows_multimodality())
    }

    /// Tie-break between two keys with the same rate-limit standing.
    /// `Ordering::Less` means `a` is preferred.
    fn prefer(&self, _a: &Key, _b: &Key) -> Ordering {
        Ordering::Equal
    }

    /// Extra lockout suggested by response headers, if the vendor sends any.
    fn rate_limit_hint(&self, _headers: &Headers) -> Option<Duration> {
        None
    }
}

/// Generic provider: a locked key list driven by a `KeyPolicy`.
pub struct KeyStore<P: KeyPolicy> {
    policy: P,
    keys: RwLock<Vec<Key>>,
    events: EventHub,
    recheck: Arc<Notify>,
}

impl<P: KeyPolicy> KeyStore<P> {
    pub fn new(policy: P, keys: Vec<Key>, events: EventHub) -> Self {
        Self {
            policy,
            keys: RwLock::new(keys),
            events,
            recheck: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Completes when `recheck` is called; consumed by the key checker.
    pub fn recheck_signal(&self) -> Arc<Notify> {
        self.recheck.clone()
    }

    async fn with_key<T>(&self, key_id: &str, f: impl FnOnce(&mut Key) -> T) -> Option<T> {
        let mut keys = self.keys.write().await;
        keys.iter_mut().find(|key| key.id == key_id).map(f)
    }

    fn compare(&self, a: &Key, b: &Key, now: Instant) -> Ordering {
        let a_limited = a.is_rate_limited(now);
        let b_limited = b.is_rate_limited(now);
        a_limited
            .cmp(&b_limited)
            .then_with(|| {
                if a_limited && b_limited {
                    a.rate_limited_until.cmp(&b.rate_limited_until)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| self.policy.prefer(a, b))
            .then_with(|| a.last_used.cmp(&b.last_used))
    }

    async fn lock_out(&self, key_id: &str, lockout: Duration) {
        let now = Instant::now();
        let updated = self
            .with_key(key_id, |key| {
                key.rate_limited_at = Some(now);
                let until = now + lockout;
                key.rate_limited_until = Some(key.rate_limited_until.map_or(until, |t| t.max(until)));
            })
            .await;
        if updated.is_some() {
            self.events.emit(Event::KeyRateLimited(KeyRateLimitedEvent {
                at: SystemTime::now(),
                service: self.policy.service(),
                key_id: key_id.to_string(),
                lockout,
            }));
        }
    }
}

#[async_trait]
impl<P: KeyPolicy> KeyProvider for KeyStore<P> {
    fn service(&self) -> Service {
        self.policy.service()
    }

    async fn list(&self) -> Vec<Key> {
        self.keys.read().await.clone()
    }

    async fn get(&self, model: &str, needs_multimodal: bool) -> Result<Key, KeyPoolError> {
        let family = self.policy.family_for_model(model);
        let now = Instant::now();
        let mut keys = self.keys.write().await;

        let mut candidates: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| {
                key.enabled && self.policy.is_eligible(key, family, needs_multimodal)
            })
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            let over_quota = keys
                .iter()
                .any(|key| key.over_quota && !key.revoked && key.supports(family));
            return Err(KeyPoolError::NoKeysAvailable {
                service: self.policy.service(),
                family,
                over_quota,
            });
        }

        candidates.sort_by(|a, b| self.compare(&keys[*a], &keys[*b], now));
        let selected = &mut keys[candidates[0]];

        selected.last_used = Some(now);
        selected.prompt_count += 1;
        let throttle_until = now + self.policy.key_reuse_delay();
        selected.rate_limited_at = Some(now);
        selected.rate_limited_until = Some(
            selected
                .rate_limited_until
                .map_or(throttle_until, |until| until.max(throttle_until)),
        );
        Ok(selected.clone())
    }

    async fn disable(&self, key_id: &str, reason: DisableReason) {
        let changed = self
            .with_key(key_id, |key| {
                let was_enabled = key.enabled;
                key.enabled = false;
                match reason {
                    DisableReason::Revoked => key.revoked = true,
                    DisableReason::Quota => key.over_quota = true,
                }
                was_enabled
            })
            .await;
        if changed == Some(true) {
            self.events.emit(Event::KeyDisabled(KeyDisabledEvent {
                at: SystemTime::now(),
                service: self.policy.service(),
                key_id: key_id.to_string(),
                reason,
            }));
        }
    }

    async fn update(&self, key_id: &str, update: KeyUpdate) {
        self.with_key(key_id, |key| update.apply(key)).await;
    }

    async fn available(&self) -> usize {
        self.keys.read().await.iter().filter(|key| key.enabled).count()
    }

    async fn increment_usage(&self, key_id: &str, family: ModelFamily, tokens: u64) {
        self.with_key(key_id, |key| {
            *key.usage.entry(family).or_default() += tokens;
        })
        .await;
    }

    async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        let now = Instant::now();
        let keys = self.keys.read().await;
        let mut eligible = keys
            .iter()
            .filter(|key| key.enabled && self.policy.is_eligible(key, family, false))
            .peekable();

        // With nothing to wait for, let the request through so it fails fast.
        if eligible.peek().is_none() {
            return Duration::ZERO;
        }
        eligible
            .map(|key| key.remaining_lockout(now))
            .min()
            .unwrap_or_default()
    }

    async fn mark_rate_limited(&self, key_id: &str) {
        self.lock_out(key_id, self.policy.rate_limit_lockout()).await;
    }

    async fn update_rate_limits(&self, key_id: &str, headers: &Headers) {
        if let Some(lockout) = self.policy.rate_limit_hint(headers) {
            self.lock_out(key_id, lockout).await;
        }
    }

    async fn recheck(&self) {
        {
            let mut keys = self.keys.write().await;
            for key in keys.iter_mut().filter(|key| key.enabled) {
                key.last_checked = None;
            }
        }
        self.recheck.notify_one();
    }
}
