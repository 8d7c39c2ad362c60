use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::events::{Event, KeyCheckedEvent};
use crate::{CheckFailure, DisableReason, EventHub, Key, KeyPolicy, KeyProvider, KeyStore, KeyUpdate};

/// Liveness and capability check for one vendor's keys.
#[async_trait]
pub trait KeyChecker: Send + Sync + 'static {
    /// Checks `key`. On success the returned update carries whatever was
    /// discovered (families, tier, model ids); `last_checked` is stamped by the runner.
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure>;
}

#[derive(Debug, Clone)]
pub struct CheckSchedule {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub recurring: bool,
    pub check_period: Duration,
    pub min_check_interval: Duration,
    /// Fraction of the delay randomly added or removed.
    pub jitter: f64,
    pub min_delay: Duration,
}

impl Default for CheckSchedule {
    fn default() -> Self {
        Self {
            batch_size: 12,
            batch_interval: Duration::from_millis(250),
            recurring: false,
            check_period: Duration::from_secs(60 * 60),
            min_check_interval: Duration::from_secs(30),
            jitter: 0.25,
            min_delay: Duration::from_secs(1),
        }
    }
}

impl CheckSchedule {
    fn jittered(&self, delay: Duration) -> Duration {
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0)).max(self.min_delay)
    }
}

/// Background task that checks a provider's keys without ever blocking selection.
pub struct KeyCheckerRunner<P: KeyPolicy> {
    store: Arc<KeyStore<P>>,
    checker: Arc<dyn KeyChecker>,
    schedule: CheckSchedule,
    events: EventHub,
}

impl<P: KeyPolicy> KeyCheckerRunner<P> {
    pub fn new(
        store: Arc<KeyStore<P>>,
        checker: Arc<dyn KeyChecker>,
        schedule: CheckSchedule,
        events: EventHub,
    ) -> Self {
        Self {
            store,
            checker,
            schedule,
            events,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let service = self.store.service();
        let recheck = self.store.recheck_signal();
        let mut last_check: Option<Instant> = None;
        info!(event = "key_checker_started", service = %service);

        loop {
            let keys = self.store.list().await;
            let enabled: Vec<Key> = keys.into_iter().filter(|key| key.enabled).collect();
            if enabled.is_empty() {
                info!(event = "key_checker_stopped", service = %service, reason = "all keys disabled");
                return;
            }

            let unchecked: Vec<&Key> = enabled.iter().filter(|key| key.last_checked.is_none()).collect();
            if !unchecked.is_empty() {
                for batch in unchecked.chunks(self.schedule.batch_size.max(1)) {
                    join_all(batch.iter().map(|key| self.check_one(key))).await;
                    sleep(self.schedule.batch_interval).await;
                }
                last_check = Some(Instant::now());
                continue;
            }

            if !self.schedule.recurring {
                recheck.notified().await;
                continue;
            }

            let Some(oldest) = enabled.iter().min_by_key(|key| key.last_checked) else {
                continue;
            };
            let now = Instant::now();
            let due = oldest
                .last_checked
                .map_or(now, |checked| checked + self.schedule.check_period);
            let earliest = last_check.map_or(now, |at| at + self.schedule.min_check_interval);
            let delay = self
                .schedule
                .jittered(due.max(earliest).saturating_duration_since(now));
            debug!(
                event = "key_check_scheduled",
                service = %service,
                key_id = %oldest.id,
                delay_ms = delay.as_millis() as u64,
            );

            tokio::select! {
                _ = sleep(delay) => {
                    self.check_one(oldest).await;
                    last_check = Some(Instant::now());
                }
                _ = recheck.notified() => {}
            }
        }
    }

    async fn check_one(&self, key: &Key) {
        let result = self.checker.check(key).await;
        let checked_at = Instant::now();
        let failure = result.as_ref().err().map(ToString::to_string);

        match result {
            Ok(mut update) => {
                update.last_checked = Some(checked_at);
                self.store.update(&key.id, update).await;
            }
            Err(CheckFailure::Revoked(_)) => {
                self.store.disable(&key.id, DisableReason::Revoked).await;
                self.store.update(&key.id, KeyUpdate::checked_at(checked_at)).await;
            }
            Err(CheckFailure::Quota(_)) => {
                self.store.disable(&key.id, DisableReason::Quota).await;
                self.store.update(&key.id, KeyUpdate::checked_at(checked_at)).await;
            }
            Err(CheckFailure::RateLimited) => {
                self.store.mark_rate_limited(&key.id).await;
                self.store.update(&key.id, KeyUpdate::checked_at(checked_at)).await;
            }
            Err(CheckFailure::Transient(_)) => {
                self.store.update(&key.id, KeyUpdate::checked_at(checked_at)).await;
            }
        }

        self.events.emit(Event::KeyChecked(KeyCheckedEvent {
            at: SystemTime::now(),
            service: key.service,
            key_id: key.id.clone(),
            failure,
        }));
    }
}
