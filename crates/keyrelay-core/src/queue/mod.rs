//! Partitioned request queue.
//!
//! Jobs wait per model family until the key pool reports no lockout for that
//! family, then a scheduler tick hands one job per partition to the
//! [`JobRunner`]. Streaming clients receive heartbeats while they wait and are
//! cut off when they stop reading.

mod estimate;
mod heartbeat;
mod limiter;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::{ModelFamily, QueueConfig};
use keyrelay_provider_core::KeyPool;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use estimate::{WaitEstimator, WaitTimeSample};
pub use heartbeat::{
    MAX_UNFLUSHED_HEARTBEATS, THROUGHPUT_WINDOW, heartbeat_frame, heartbeat_size, joining_frame,
};
pub use limiter::{ConcurrencyLimiter, ConcurrencySlot};

use crate::client::ClientHandle;
use crate::error::GatewayError;
use crate::job::{ProxyContext, ProxyJob};

/// Window in which a caller counts towards the proxy load.
pub const CALLER_WINDOW: Duration = Duration::from_secs(60);
/// Completed wait samples older than this are discarded.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(300);

/// Receives jobs the scheduler has taken off the queue.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: ProxyJob);
}

/// Aborts its task when the queue entry goes away.
#[derive(Debug)]
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct QueueEntry {
    id: u64,
    job: ProxyJob,
    tasks: Vec<TaskGuard>,
}

impl QueueEntry {
    fn score(&self, epoch: Instant, factor: f64) -> f64 {
        let start_ms = self.job.start_time.saturating_duration_since(epoch).as_secs_f64() * 1000.0;
        start_ms + factor * self.job.weight() as f64
    }

    fn into_job(self) -> ProxyJob {
        drop(self.tasks);
        self.job
    }
}

#[derive(Debug)]
struct QueueState {
    entries: Vec<QueueEntry>,
    next_id: u64,
    callers: HashMap<String, Instant>,
    estimator: WaitEstimator,
}

struct QueueInner {
    config: QueueConfig,
    pool: KeyPool,
    limiter: Arc<ConcurrencyLimiter>,
    state: Mutex<QueueState>,
    epoch: Instant,
}

#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, pool: KeyPool) -> Self {
        let estimator = WaitEstimator::new(config.ema_alpha, SAMPLE_WINDOW);
        Self {
            inner: Arc::new(QueueInner {
                limiter: ConcurrencyLimiter::new(config.concurrency_limit),
                config,
                pool,
                state: Mutex::new(QueueState {
                    entries: Vec::new(),
                    next_id: 0,
                    callers: HashMap::new(),
                    estimator,
                }),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &KeyPool {
        &self.inner.pool
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.inner.limiter
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a new request. The job holds one of the caller's concurrency
    /// slots until it is dropped.
    pub fn enqueue(&self, ctx: ProxyContext, client: ClientHandle) -> Result<(), GatewayError> {
        let now = Instant::now();
        self.lock().callers.insert(ctx.identifier.clone(), now);

        let Some(slot) = self.inner.limiter.try_acquire(&ctx.identifier) else {
            return Err(GatewayError::ConcurrencyLimit {
                identifier: ctx.identifier,
                limit: self.inner.limiter.limit(),
            });
        };
        if !ctx.is_streaming && self.proxy_load() > self.inner.config.load_threshold {
            return Err(GatewayError::Admission);
        }

        self.push(ProxyJob {
            ctx,
            client,
            retry_count: 0,
            start_time: now,
            queue_out_time: None,
            slot: Some(slot),
        });
        Ok(())
    }

    /// Puts a dispatched job back. Admission is not re-evaluated and the job
    /// keeps its original start time.
    pub fn reenqueue(&self, mut job: ProxyJob) {
        job.retry_count += 1;
        job.queue_out_time = None;
        if job.client.is_closed() {
            debug!(
                event = "queue_reenqueue_dropped",
                request_id = %job.ctx.request_id,
                "client left before retry"
            );
            return;
        }
        info!(
            event = "queue_reenqueue",
            request_id = %job.ctx.request_id,
            partition = %job.partition(),
            retry = job.retry_count,
            "request re-enqueued"
        );
        self.push(job);
    }

    fn push(&self, job: ProxyJob) {
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let partition = job.partition();
        let position = state
            .entries
            .iter()
            .filter(|entry| entry.job.partition() == partition)
            .count()
            + 1;

        let mut tasks = vec![TaskGuard(tokio::spawn(watch_disconnect(
            weak.clone(),
            id,
            job.client.clone(),
        )))];
        if let Some(sink) = job.client.sink() {
            sink.try_write(joining_frame(position));
            tasks.push(TaskGuard(tokio::spawn(heartbeat::heartbeat_loop(
                weak,
                id,
                sink.clone(),
                self.inner.config.clone(),
            ))));
        }

        debug!(
            event = "queue_enqueue",
            request_id = %job.ctx.request_id,
            identifier = %job.ctx.identifier,
            partition = %partition,
            position,
            "request queued"
        );
        state.entries.push(QueueEntry { id, job, tasks });
    }

    /// Removes the best entry of `partition`: lowest
    /// `start_ms + factor * tokens`, earliest enqueued on ties.
    pub fn dequeue(&self, partition: ModelFamily) -> Option<ProxyJob> {
        let factor = self.inner.config.tokens_punishment_factor;
        let epoch = self.inner.epoch;
        let entry = {
            let mut state = self.lock();
            let index = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.job.partition() == partition)
                .min_by(|(_, a), (_, b)| {
                    a.score(epoch, factor)
                        .total_cmp(&b.score(epoch, factor))
                        .then(a.id.cmp(&b.id))
                })
                .map(|(index, _)| index)?;
            state.entries.remove(index)
        };
        let mut job = entry.into_job();
        job.queue_out_time = Some(Instant::now());
        Some(job)
    }

    /// Removes entry `id` if it is still queued.
    fn take(&self, id: u64) -> Option<ProxyJob> {
        let entry = {
            let mut state = self.lock();
            let index = state.entries.iter().position(|entry| entry.id == id)?;
            state.entries.remove(index)
        };
        Some(entry.into_job())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition_len(&self, partition: ModelFamily) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.job.partition() == partition)
            .count()
    }

    pub fn waiting_partitions(&self) -> BTreeSet<ModelFamily> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.job.partition())
            .collect()
    }

    /// `max(unique callers in the last minute, queue length)`.
    pub fn proxy_load(&self) -> usize {
        let now = Instant::now();
        let state = self.lock();
        let callers = state
            .callers
            .values()
            .filter(|seen| now.saturating_duration_since(**seen) < CALLER_WINDOW)
            .count();
        callers.max(state.entries.len())
    }

    /// Records how long a completed job waited before dispatch.
    pub fn track_wait_time(&self, job: &ProxyJob) {
        let Some(end) = job.queue_out_time else {
            return;
        };
        self.lock().estimator.record(WaitTimeSample {
            partition: job.partition(),
            start: job.start_time,
            end,
        });
    }

    pub fn estimated_wait_time(&self, partition: ModelFamily) -> Duration {
        self.lock().estimator.estimate(partition)
    }

    pub fn recompute_estimates(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut longest: BTreeMap<ModelFamily, Duration> = BTreeMap::new();
        for entry in &state.entries {
            let age = now.saturating_duration_since(entry.job.start_time);
            let slot = longest.entry(entry.job.partition()).or_default();
            *slot = (*slot).max(age);
        }
        state.estimator.recompute(now, &longest);
    }

    /// Dispatches at most one job per partition whose lockout has elapsed.
    pub async fn tick(&self, runner: &Arc<dyn JobRunner>) -> usize {
        let mut dispatched = 0;
        for partition in self.waiting_partitions() {
            if !self.inner.pool.get_lockout_period(partition).await.is_zero() {
                continue;
            }
            if let Some(job) = self.dequeue(partition) {
                let runner = runner.clone();
                tokio::spawn(async move { runner.run(job).await });
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Fails entries that waited longer than the stall timeout and prunes old
    /// bookkeeping. Returns how many entries were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let stall = self.inner.config.stall_timeout();
        let stalled: Vec<QueueEntry> = {
            let mut state = self.lock();
            let (stalled, waiting) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|entry| now.saturating_duration_since(entry.job.start_time) > stall);
            state.entries = waiting;
            state.estimator.prune(now);
            state
                .callers
                .retain(|_, seen| now.saturating_duration_since(*seen) < CALLER_WINDOW);
            stalled
        };

        let removed = stalled.len();
        for entry in stalled {
            let job = entry.into_job();
            warn!(
                event = "queue_stalled",
                request_id = %job.ctx.request_id,
                partition = %job.partition(),
                "request timed out in queue"
            );
            job.client
                .fail(&GatewayError::QueueTimeout, job.ctx.inbound, &job.ctx.model)
                .await;
        }
        removed
    }

    /// Spawns the scheduler, stall sweep and wait estimator loops.
    pub fn start(&self, runner: Arc<dyn JobRunner>) -> Vec<JoinHandle<()>> {
        let config = &self.inner.config;

        let queue = self.clone();
        let tick = config.tick();
        let scheduler = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                queue.tick(&runner).await;
            }
        });

        let queue = self.clone();
        let sweep = config.sweep_interval();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + sweep, sweep);
            loop {
                interval.tick().await;
                queue.sweep().await;
            }
        });

        let queue = self.clone();
        let estimate = config.wait_estimate_interval();
        let estimator = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + estimate, estimate);
            loop {
                interval.tick().await;
                queue.recompute_estimates();
            }
        });

        vec![scheduler, sweeper, estimator]
    }
}

/// Removes the entry once its client disconnects.
async fn watch_disconnect(queue: Weak<QueueInner>, id: u64, client: ClientHandle) {
    client.closed().await;
    let Some(inner) = queue.upgrade() else {
        return;
    };
    if let Some(job) = (RequestQueue { inner }).take(id) {
        info!(
            event = "queue_client_aborted",
            request_id = %job.ctx.request_id,
            identifier = %job.ctx.identifier,
            "client disconnected while queued"
        );
    }
}
