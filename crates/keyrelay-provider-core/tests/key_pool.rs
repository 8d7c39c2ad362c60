use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ModelFamily, Service};
use keyrelay_provider_core::{
    CheckFailure, CheckSchedule, DisableReason, Event, EventHub, Key, KeyChecker,
    KeyCheckerRunner, KeyPolicy, KeyPool, KeyPoolError, KeyProvider, KeyStore, KeyUpdate,
    VendorMeta,
};
use tokio::time::{advance, sleep, timeout};

struct TestPolicy;

impl KeyPolicy for TestPolicy {
    fn service(&self) -> Service {
        Service::OpenAI
    }

    fn rate_limit_lockout(&self) -> Duration {
        Duration::from_millis(2000)
    }

    fn key_reuse_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn prefer(&self, a: &Key, b: &Key) -> Ordering {
        let trial = |key: &Key| matches!(key.meta, VendorMeta::OpenAI { is_trial: true, .. });
        trial(a).cmp(&trial(b))
    }
}

fn openai_key(secret: &str, is_trial: bool) -> Key {
    Key::new(
        Service::OpenAI,
        secret,
        VendorMeta::OpenAI {
            is_trial,
            organization_id: None,
            model_snapshots: Vec::new(),
        },
    )
}

fn store(keys: Vec<Key>, hub: EventHub) -> Arc<KeyStore<TestPolicy>> {
    Arc::new(KeyStore::new(TestPolicy, keys, hub))
}

#[tokio::test(start_paused = true)]
async fn lockout_period_expires_after_rate_limit() {
    let key = openai_key("sk-one", false);
    let provider = store(vec![key.clone()], EventHub::default());
    let pool = KeyPool::new().with_provider(provider);

    assert_eq!(pool.get_lockout_period(ModelFamily::Gpt4).await, Duration::ZERO);

    pool.mark_rate_limited(&key).await;
    let lockout = pool.get_lockout_period(ModelFamily::Gpt4).await;
    assert!(lockout > Duration::ZERO);
    assert!(lockout <= Duration::from_millis(2000));

    advance(Duration::from_millis(2000)).await;
    assert_eq!(pool.get_lockout_period(ModelFamily::Gpt4).await, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_until_never_moves_backwards() {
    let key = openai_key("sk-one", false);
    let provider = store(vec![key.clone()], EventHub::default());

    let mut last = None;
    for _ in 0..5 {
        provider.mark_rate_limited(&key.id).await;
        let until = provider.list().await[0].rate_limited_until;
        assert!(until >= last);
        last = until;
        advance(Duration::from_millis(300)).await;
    }

    // A shorter throttle after selection must not shorten the lockout.
    let before = provider.list().await[0].rate_limited_until;
    let _ = provider.get("gpt-4", false).await;
    let after = provider.list().await[0].rate_limited_until;
    assert!(after >= before);
}

#[tokio::test(start_paused = true)]
async fn selection_prefers_unlimited_then_policy_then_lru() {
    let trial = openai_key("sk-trial", true);
    let paid_a = openai_key("sk-paid-a", false);
    let paid_b = openai_key("sk-paid-b", false);
    let provider = store(
        vec![trial.clone(), paid_a.clone(), paid_b.clone()],
        EventHub::default(),
    );

    let first = provider.get("gpt-4", false).await.unwrap();
    assert_ne!(first.id, trial.id);

    // The first pick is now throttled, so the other paid key comes next.
    let second = provider.get("gpt-4", false).await.unwrap();
    assert_ne!(second.id, trial.id);
    assert_ne!(second.id, first.id);

    let third = provider.get("gpt-4", false).await.unwrap();
    assert_eq!(third.id, trial.id);

    // Everyone is throttled; the earliest expiry wins.
    let fourth = provider.get("gpt-4", false).await.unwrap();
    assert_eq!(fourth.id, first.id);

    advance(Duration::from_secs(1)).await;
    let fifth = provider.get("gpt-4", false).await.unwrap();
    assert_ne!(fifth.id, trial.id);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_key_leaves_sibling_selectable() {
    let a = openai_key("sk-a", false);
    let b = openai_key("sk-b", false);
    let provider = store(vec![a.clone(), b.clone()], EventHub::default());
    let pool = KeyPool::new().with_provider(provider.clone());

    let picked = pool.get("gpt-4", None, false).await.unwrap();
    pool.mark_rate_limited(&picked).await;

    advance(Duration::from_millis(200)).await;
    assert_eq!(pool.get_lockout_period(ModelFamily::Gpt4).await, Duration::ZERO);
    let other = pool.get("gpt-4", None, false).await.unwrap();
    assert_ne!(other.id, picked.id);
}

#[tokio::test]
async fn disable_emits_once_and_reports_quota() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();
    let key = openai_key("sk-one", false);
    let provider = store(vec![key.clone()], hub);
    let pool = KeyPool::new().with_provider(provider.clone());

    pool.disable(&key, DisableReason::Quota).await;
    pool.disable(&key, DisableReason::Quota).await;

    let ev = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(ev, Event::KeyDisabled(ref disabled) if disabled.reason == DisableReason::Quota));
    assert!(rx.try_recv().is_err());

    let err = pool.get("gpt-4", None, false).await.unwrap_err();
    assert_eq!(
        err,
        KeyPoolError::NoKeysAvailable {
            service: Service::OpenAI,
            family: ModelFamily::Gpt4,
            over_quota: true,
        }
    );
    assert_eq!(pool.available(None).await, 0);
    assert_eq!(pool.get_lockout_period(ModelFamily::Gpt4).await, Duration::ZERO);
}

#[tokio::test]
async fn unknown_model_and_missing_service_are_errors() {
    let pool = KeyPool::new().with_provider(store(vec![], EventHub::default()));
    assert!(matches!(
        pool.get("llama-3", None, false).await,
        Err(KeyPoolError::UnknownModel(_))
    ));
    assert!(matches!(
        pool.get("claude-3-opus-20240229", None, false).await,
        Err(KeyPoolError::ServiceNotConfigured(Service::Anthropic))
    ));
}

#[tokio::test]
async fn usage_is_tracked_per_family() {
    let key = openai_key("sk-one", false);
    let provider = store(vec![key.clone()], EventHub::default());
    let pool = KeyPool::new().with_provider(provider.clone());

    pool.increment_usage(&key, "gpt-4", 10).await;
    pool.increment_usage(&key, "gpt-4", 5).await;
    pool.increment_usage(&key, "gpt-3.5-turbo", 7).await;

    let snapshot = &provider.list().await[0];
    assert_eq!(snapshot.usage.get(&ModelFamily::Gpt4), Some(&15));
    assert_eq!(snapshot.usage.get(&ModelFamily::Turbo), Some(&7));
    assert_eq!(snapshot.total_usage(), 22);
}

struct ScriptedChecker {
    calls: AtomicUsize,
}

#[async_trait]
impl KeyChecker for ScriptedChecker {
    async fn check(&self, key: &Key) -> Result<KeyUpdate, CheckFailure> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if key.secret.contains("dead") {
            return Err(CheckFailure::Revoked("invalid_api_key".into()));
        }
        Ok(KeyUpdate {
            model_families: Some([ModelFamily::Turbo].into_iter().collect()),
            ..Default::default()
        })
    }
}

async fn wait_for_calls(checker: &ScriptedChecker, expected: usize) {
    timeout(Duration::from_secs(10), async {
        while checker.calls.load(AtomicOrdering::SeqCst) < expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn checker_visits_each_key_once_and_on_recheck() {
    let hub = EventHub::new(64);
    let good = openai_key("sk-good", false);
    let dead = openai_key("sk-dead", false);
    let provider = store(vec![good.clone(), dead.clone()], hub.clone());
    let checker = Arc::new(ScriptedChecker {
        calls: AtomicUsize::new(0),
    });
    let handle = KeyCheckerRunner::new(
        provider.clone(),
        checker.clone(),
        CheckSchedule::default(),
        hub,
    )
    .spawn();

    wait_for_calls(&checker, 2).await;

    let keys = provider.list().await;
    let good_after = keys.iter().find(|key| key.id == good.id).unwrap();
    let dead_after = keys.iter().find(|key| key.id == dead.id).unwrap();
    assert!(good_after.last_checked.is_some());
    assert!(!good_after.supports(ModelFamily::Gpt4));
    assert!(!dead_after.enabled && dead_after.revoked);

    provider.recheck().await;
    wait_for_calls(&checker, 3).await;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(checker.calls.load(AtomicOrdering::SeqCst), 3);

    handle.abort();
}
