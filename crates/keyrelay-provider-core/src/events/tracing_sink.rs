use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use super::{Event, EventSink};

/// Writes every pool event as a structured log line.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::KeyDisabled(ev) => warn!(
                    event = "key_disabled",
                    service = %ev.service,
                    key_id = %ev.key_id,
                    reason = ?ev.reason,
                ),
                Event::KeyRateLimited(ev) => info!(
                    event = "key_rate_limited",
                    service = %ev.service,
                    key_id = %ev.key_id,
                    lockout_ms = ev.lockout.as_millis() as u64,
                ),
                Event::KeyChecked(ev) => match &ev.failure {
                    None => info!(
                        event = "key_checked",
                        service = %ev.service,
                        key_id = %ev.key_id,
                    ),
                    Some(failure) => warn!(
                        event = "key_check_failed",
                        service = %ev.service,
                        key_id = %ev.key_id,
                        failure = %failure,
                    ),
                },
            }
        })
    }
}
