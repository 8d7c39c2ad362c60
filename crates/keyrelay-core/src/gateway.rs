use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::HeaderMap;
use keyrelay_common::{GatewayConfig, ModelFamily};
use keyrelay_provider_core::{
    EventHub, Headers, KeyPoolError, TracingEventSink, UpstreamClient,
};
use keyrelay_provider_impl::VendorRegistry;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::client::{ClientHandle, ClientStream, DEFAULT_SINK_CAPACITY};
use crate::collab::{Gatekeeper, UsageSink};
use crate::context::{InboundRequest, RouteSpec, build_context};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::queue::RequestQueue;
use crate::response::ProxyResponse;

/// Pool events buffered for slow subscribers.
const EVENT_BUFFER: usize = 256;

/// What the HTTP layer sends back for a proxied request.
#[derive(Debug)]
pub enum GatewayReply {
    Blocking(ProxyResponse),
    /// An SSE body; heartbeats flow while the request waits in the queue.
    Stream(ClientStream),
}

pub struct Gateway {
    queue: RequestQueue,
    registry: Arc<VendorRegistry>,
    gatekeeper: Arc<dyn Gatekeeper>,
    events: EventHub,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(
        queue: RequestQueue,
        registry: Arc<VendorRegistry>,
        gatekeeper: Arc<dyn Gatekeeper>,
        events: EventHub,
    ) -> Self {
        Self {
            queue,
            registry,
            gatekeeper,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Builds every vendor from `config` and starts the scheduler and key
    /// checkers.
    pub async fn launch(
        config: &GatewayConfig,
        upstream: Arc<dyn UpstreamClient>,
        gatekeeper: Arc<dyn Gatekeeper>,
        usage: Arc<dyn UsageSink>,
    ) -> Result<Self, KeyPoolError> {
        let events = EventHub::new(EVENT_BUFFER).with_sink(Arc::new(TracingEventSink::new()));

        let registry = Arc::new(VendorRegistry::from_config(
            config,
            upstream.clone(),
            events.clone(),
        )?);
        let queue = RequestQueue::new(config.queue.clone(), registry.pool().clone());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            upstream,
            usage,
        ));

        let gateway = Self::new(queue, registry, gatekeeper, events);
        gateway.start(dispatcher, config);
        info!(
            event = "gateway_started",
            services = ?gateway.registry.services().collect::<Vec<_>>(),
        );
        Ok(gateway)
    }

    fn start(&self, dispatcher: Arc<Dispatcher>, config: &GatewayConfig) {
        let mut tasks = self.queue.start(dispatcher);
        tasks.extend(self.registry.spawn_checkers(&config.checks));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<VendorRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Identifies the caller, builds the request context and queues it.
    pub async fn handle(
        &self,
        route: RouteSpec,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        model_action: Option<String>,
        body: Bytes,
    ) -> GatewayReply {
        match self.submit(route, headers, peer, model_action, body).await {
            Ok(reply) => reply,
            Err(err) => GatewayReply::Blocking(err.into_response(route.inbound)),
        }
    }

    async fn submit(
        &self,
        route: RouteSpec,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        model_action: Option<String>,
        body: Bytes,
    ) -> Result<GatewayReply, GatewayError> {
        let identifier = self.gatekeeper.identify(headers, peer)?;
        let ctx = build_context(
            route,
            InboundRequest {
                identifier,
                headers: headers_to_vec(headers),
                model_action,
                body: body.to_vec(),
            },
        )?;

        if ctx.is_streaming {
            let (client, stream) = ClientHandle::streaming(DEFAULT_SINK_CAPACITY);
            self.queue.enqueue(ctx, client)?;
            return Ok(GatewayReply::Stream(stream));
        }

        let (client, reply) = ClientHandle::blocking();
        self.queue.enqueue(ctx, client)?;
        reply
            .recv()
            .await
            .map(GatewayReply::Blocking)
            .ok_or_else(|| GatewayError::Internal("request dropped without a response".to_string()))
    }

    /// Queue depth, wait estimates and key counts.
    pub async fn status(&self) -> Value {
        let now = Instant::now();
        let mut services = BTreeMap::new();
        for key in self.registry.pool().list().await {
            let entry = services.entry(key.service.to_string()).or_insert_with(|| {
                json!({"total": 0, "active": 0, "revoked": 0, "over_quota": 0, "rate_limited": 0})
            });
            bump(entry, "total");
            if key.enabled {
                bump(entry, "active");
            }
            if key.revoked {
                bump(entry, "revoked");
            }
            if key.over_quota {
                bump(entry, "over_quota");
            }
            if key.is_rate_limited(now) {
                bump(entry, "rate_limited");
            }
        }

        let mut partitions = BTreeMap::new();
        for family in ModelFamily::ALL {
            let waiting = self.queue.partition_len(*family);
            let estimate = self.queue.estimated_wait_time(*family);
            if waiting == 0 && estimate.is_zero() {
                continue;
            }
            partitions.insert(
                family.to_string(),
                json!({"waiting": waiting, "estimated_wait_ms": estimate.as_millis() as u64}),
            );
        }

        json!({
            "queue": {
                "length": self.queue.len(),
                "load": self.queue.proxy_load(),
                "partitions": partitions,
            },
            "keys": services,
        })
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bump(entry: &mut Value, field: &str) {
    if let Some(count) = entry.get_mut(field) {
        *count = json!(count.as_u64().unwrap_or(0) + 1);
    }
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
