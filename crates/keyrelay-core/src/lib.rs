//! Queueing, dispatch and response normalization for the gateway.

pub mod client;
pub mod collab;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod job;
pub mod queue;
pub mod response;
pub mod upstream_client;

pub use client::{ClientHandle, ClientSink, ClientStream, SinkKilled, WriteOutcome};
pub use collab::{DefaultGatekeeper, Gatekeeper, TracingUsageSink, UsageRecord, UsageSink};
pub use context::{InboundRequest, ROUTES, RouteSpec, build_context};
pub use dispatch::{Dispatcher, StreamNormalizer};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayReply};
pub use job::{ProxyContext, ProxyJob};
pub use queue::{JobRunner, RequestQueue};
pub use response::ProxyResponse;
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
