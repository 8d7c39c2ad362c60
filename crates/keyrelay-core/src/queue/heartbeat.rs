use std::sync::Weak;

use keyrelay_common::QueueConfig;
use keyrelay_protocol::encode_comment;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

use super::{QueueInner, RequestQueue};
use crate::client::{ClientSink, WriteOutcome};

/// Consecutive heartbeats that may find unflushed bytes before the stream is cut.
pub const MAX_UNFLUSHED_HEARTBEATS: u32 = 3;
/// Heartbeats per throughput window.
pub const THROUGHPUT_WINDOW: u64 = 2;

/// Payload size for the current load.
pub fn heartbeat_size(load: usize, config: &QueueConfig) -> usize {
    if load <= config.load_threshold {
        return config.min_heartbeat_size;
    }
    let excess = (load - config.load_threshold) as f64;
    let size = config.min_heartbeat_size as f64 + (excess * config.payload_scale_factor).powi(2);
    size.min(config.max_heartbeat_size as f64) as usize
}

pub fn heartbeat_frame(size: usize) -> String {
    encode_comment(&format!("queue heartbeat {}", ".".repeat(size)))
}

pub fn joining_frame(position: usize) -> String {
    encode_comment(&format!("joining queue at position {position}"))
}

/// Keeps a queued stream alive and cuts clients that stopped reading.
pub(super) async fn heartbeat_loop(
    queue: Weak<QueueInner>,
    entry_id: u64,
    sink: ClientSink,
    config: QueueConfig,
) {
    let period = config.heartbeat_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut unflushed = 0u32;
    let mut beats = 0u64;
    let mut window_start = sink.drained_bytes();

    loop {
        interval.tick().await;
        let Some(inner) = queue.upgrade() else {
            return;
        };
        let queue = RequestQueue { inner };

        if sink.pending_bytes() > 0 {
            unflushed += 1;
        } else {
            unflushed = 0;
        }

        let size = heartbeat_size(queue.proxy_load(), &config);
        if sink.try_write(heartbeat_frame(size)) == WriteOutcome::Closed {
            return;
        }
        beats += 1;

        let mut reason = None;
        if unflushed >= MAX_UNFLUSHED_HEARTBEATS {
            reason = Some("unflushed heartbeats");
        }
        if beats % THROUGHPUT_WINDOW == 0 {
            let drained = sink.drained_bytes();
            if drained.saturating_sub(window_start) < config.min_heartbeat_size as u64 {
                reason = Some("low throughput");
            }
            window_start = drained;
        }

        if let Some(reason) = reason {
            warn!(
                event = "queue_client_unresponsive",
                entry = entry_id,
                reason,
                pending = sink.pending_bytes(),
                "destroying unresponsive queued stream"
            );
            sink.kill();
            drop(queue.take(entry_id));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_grows_with_excess_load() {
        let config = QueueConfig {
            load_threshold: 10,
            ..QueueConfig::default()
        };
        assert_eq!(heartbeat_size(3, &config), 512);
        assert_eq!(heartbeat_size(10, &config), 512);
        // 512 + (2 * 6)^2
        assert_eq!(heartbeat_size(12, &config), 656);
        assert_eq!(heartbeat_size(100_000, &config), 1024 * 1024);
    }

    #[test]
    fn frames_are_sse_comments() {
        let frame = heartbeat_frame(4);
        assert_eq!(frame, ": queue heartbeat ....\n\n");
        assert_eq!(joining_frame(2), ": joining queue at position 2\n\n");
    }
}
