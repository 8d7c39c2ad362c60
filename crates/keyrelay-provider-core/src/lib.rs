//! Key pool and request-preparation primitives shared by every vendor.
//!
//! This crate does not perform HTTP itself. Vendors describe requests through
//! `OutboundRequest`/`ProxyRequestManager` and check keys through the
//! `UpstreamClient` trait; the gateway crate supplies the concrete client.

pub mod checker;
pub mod errors;
pub mod events;
pub mod headers;
pub mod key;
pub mod pool;
pub mod provider;
pub mod request;
pub mod upstream;

pub use checker::{CheckSchedule, KeyChecker, KeyCheckerRunner};
pub use errors::{CheckFailure, KeyPoolError};
pub use events::{
    Event, EventHub, EventSink, KeyCheckedEvent, KeyDisabledEvent, KeyRateLimitedEvent, ServiceEvents,
    TracingEventSink,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use key::{AnthropicTier, AwsLoggingStatus, DisableReason, Key, KeyUpdate, VendorMeta, key_id};
pub use pool::KeyPool;
pub use provider::{KeyPolicy, KeyProvider, KeyStore};
pub use request::{OutboundRequest, ProxyRequestManager, SignedRequest};
pub use upstream::{
    ByteStream, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};
