use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use keyrelay_common::ModelFamily;
use tokio::time::Instant;

/// How long one completed request spent waiting in its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeSample {
    pub partition: ModelFamily,
    pub start: Instant,
    pub end: Instant,
}

impl WaitTimeSample {
    fn wait(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Ema {
    recent: f64,
    current: f64,
}

/// Smoothed per-partition wait estimates, recomputed on a timer.
#[derive(Debug)]
pub struct WaitEstimator {
    alpha: f64,
    window: Duration,
    samples: Vec<WaitTimeSample>,
    emas: BTreeMap<ModelFamily, Ema>,
    estimates: BTreeMap<ModelFamily, Duration>,
}

impl WaitEstimator {
    pub fn new(alpha: f64, window: Duration) -> Self {
        Self {
            alpha,
            window,
            samples: Vec::new(),
            emas: BTreeMap::new(),
            estimates: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, sample: WaitTimeSample) {
        self.samples.push(sample);
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.samples
            .retain(|sample| now.saturating_duration_since(sample.end) <= window);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// `longest_waiting` holds the age of the oldest entry of every partition
    /// that currently has waiters.
    pub fn recompute(&mut self, now: Instant, longest_waiting: &BTreeMap<ModelFamily, Duration>) {
        let mut partitions: BTreeSet<ModelFamily> = self.emas.keys().copied().collect();
        partitions.extend(self.samples.iter().map(|sample| sample.partition));
        partitions.extend(longest_waiting.keys().copied());

        for partition in partitions {
            let waits: Vec<f64> = self
                .samples
                .iter()
                .filter(|sample| {
                    sample.partition == partition
                        && now.saturating_duration_since(sample.end) <= self.window
                })
                .map(|sample| sample.wait().as_secs_f64() * 1000.0)
                .collect();
            let recent = if waits.is_empty() {
                0.0
            } else {
                waits.iter().sum::<f64>() / waits.len() as f64
            };
            let waiting = longest_waiting.get(&partition);
            let current = waiting.map_or(0.0, |age| age.as_secs_f64() * 1000.0);

            let ema = self.emas.entry(partition).or_default();
            ema.recent = self.alpha * recent + (1.0 - self.alpha) * ema.recent;
            ema.current = self.alpha * current + (1.0 - self.alpha) * ema.current;
            let millis = if waiting.is_some() {
                ema.recent.max(ema.current)
            } else {
                ema.recent
            };
            self.estimates
                .insert(partition, Duration::from_secs_f64(millis.max(0.0) / 1000.0));
        }
    }

    pub fn estimate(&self, partition: ModelFamily) -> Duration {
        self.estimates.get(&partition).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(duration: Duration) -> u128 {
        duration.as_millis()
    }

    #[tokio::test(start_paused = true)]
    async fn estimates_follow_ema_of_recent_and_current() {
        let mut estimator = WaitEstimator::new(0.5, Duration::from_secs(300));
        let start = Instant::now();
        let end = start + Duration::from_millis(1000);
        estimator.record(WaitTimeSample {
            partition: ModelFamily::Claude,
            start,
            end,
        });

        estimator.recompute(end, &BTreeMap::new());
        assert_eq!(millis(estimator.estimate(ModelFamily::Claude)), 500);

        let waiting = BTreeMap::from([(ModelFamily::Claude, Duration::from_millis(4000))]);
        estimator.recompute(end, &waiting);
        // recent ema 750, current ema 2000
        assert_eq!(millis(estimator.estimate(ModelFamily::Claude)), 2000);
        assert_eq!(estimator.estimate(ModelFamily::Gpt4), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_are_pruned() {
        let mut estimator = WaitEstimator::new(0.3, Duration::from_secs(300));
        let start = Instant::now();
        estimator.record(WaitTimeSample {
            partition: ModelFamily::Turbo,
            start,
            end: start + Duration::from_secs(1),
        });
        estimator.prune(start + Duration::from_secs(200));
        assert_eq!(estimator.sample_count(), 1);
        estimator.prune(start + Duration::from_secs(302));
        assert_eq!(estimator.sample_count(), 0);
    }
}
