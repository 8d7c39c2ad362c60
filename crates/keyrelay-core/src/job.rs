use keyrelay_common::{ApiFormat, ModelFamily, Service};
use keyrelay_provider_core::Headers;
use serde_json::Value;
use tokio::time::Instant;

use crate::client::ClientHandle;
use crate::queue::ConcurrencySlot;

/// Everything the dispatcher needs to know about one client request.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub request_id: String,
    /// Caller identity used for concurrency limits and accounting.
    pub identifier: String,
    pub service: Service,
    /// Dialect the client speaks.
    pub inbound: ApiFormat,
    /// Dialect sent upstream; `body` is already written in it.
    pub outbound: ApiFormat,
    pub model: String,
    pub family: ModelFamily,
    pub is_streaming: bool,
    pub needs_multimodal: bool,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    /// Client headers that may be forwarded upstream.
    pub headers: Headers,
    pub body: Value,
}

/// A request travelling through the queue. Holding it holds the caller's
/// concurrency slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ProxyJob {
    pub ctx: ProxyContext,
    pub client: ClientHandle,
    pub retry_count: u32,
    pub start_time: Instant,
    pub queue_out_time: Option<Instant>,
    pub(crate) slot: Option<ConcurrencySlot>,
}

impl ProxyJob {
    pub fn partition(&self) -> ModelFamily {
        self.ctx.family
    }

    /// Tokens already attributed to this request, used for queue punishment.
    pub fn weight(&self) -> u64 {
        self.ctx.prompt_tokens + self.ctx.output_tokens
    }
}
