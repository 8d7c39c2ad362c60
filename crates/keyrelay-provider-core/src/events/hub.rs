use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use keyrelay_common::Service;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::types::Event;

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Fan-out of pool events to broadcast subscribers and a fixed set of sinks.
///
/// Sinks are attached while the hub is being built; clones share the channel
/// and see the sinks that existed when they were cloned.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
    sinks: Arc<[Arc<dyn EventSink>]>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx,
            sinks: Vec::new().into(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let mut sinks = self.sinks.to_vec();
        sinks.push(sink);
        self.sinks = sinks.into();
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribes to events about one vendor's keys only.
    pub fn subscribe_service(&self, service: Service) -> ServiceEvents {
        ServiceEvents {
            service,
            rx: self.tx.subscribe(),
        }
    }

    /// Sink writes run on spawned tasks and are not awaited.
    pub fn emit(&self, event: Event) {
        for sink in self.sinks.iter().cloned() {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A broadcast receiver filtered to a single service.
pub struct ServiceEvents {
    service: Service,
    rx: broadcast::Receiver<Event>,
}

impl ServiceEvents {
    pub fn service(&self) -> Service {
        self.service
    }

    /// Next event for this service, or `None` once every hub clone is gone.
    /// Events dropped while lagging are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.service() == self.service => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(event = "pool_events_lagged", service = %self.service, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::DisableReason;
    use crate::events::{KeyDisabledEvent, KeyRateLimitedEvent};

    fn rate_limited(service: Service, key_id: &str) -> Event {
        Event::KeyRateLimited(KeyRateLimitedEvent {
            at: SystemTime::now(),
            service,
            key_id: key_id.to_string(),
            lockout: Duration::from_secs(1),
        })
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl EventSink for Collect {
        fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(event.key_id().to_string());
            })
        }
    }

    #[tokio::test]
    async fn service_subscription_skips_other_vendors() {
        let hub = EventHub::new(8);
        let mut anthropic = hub.subscribe_service(Service::Anthropic);

        hub.emit(rate_limited(Service::OpenAI, "oai-1"));
        hub.emit(Event::KeyDisabled(KeyDisabledEvent {
            at: SystemTime::now(),
            service: Service::Anthropic,
            key_id: "ant-1".to_string(),
            reason: DisableReason::Revoked,
        }));
        hub.emit(rate_limited(Service::Aws, "aws-1"));
        hub.emit(rate_limited(Service::Anthropic, "ant-2"));
        drop(hub);

        let mut seen = Vec::new();
        while let Some(event) = anthropic.recv().await {
            assert_eq!(event.service(), Service::Anthropic);
            seen.push(event.key_id().to_string());
        }
        assert_eq!(seen, ["ant-1", "ant-2"]);
    }

    #[tokio::test]
    async fn lagging_subscriber_resumes_with_newest_events() {
        let hub = EventHub::new(2);
        let mut openai = hub.subscribe_service(Service::OpenAI);
        for id in ["a", "b", "c", "d"] {
            hub.emit(rate_limited(Service::OpenAI, id));
        }
        assert_eq!(openai.recv().await.unwrap().key_id(), "c");
        assert_eq!(openai.recv().await.unwrap().key_id(), "d");
    }

    #[tokio::test]
    async fn sinks_attached_when_built_see_every_event() {
        let collect = Arc::new(Collect::default());
        let hub = EventHub::default().with_sink(collect.clone());
        let clone = hub.clone();

        hub.emit(rate_limited(Service::OpenAI, "first"));
        clone.emit(rate_limited(Service::MistralAI, "second"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut written = collect.0.lock().unwrap().clone();
        written.sort();
        assert_eq!(written, ["first", "second"]);
    }
}
