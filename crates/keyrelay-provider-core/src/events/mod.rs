mod hub;
mod tracing_sink;
mod types;

pub use hub::{EventHub, EventSink, ServiceEvents};
pub use tracing_sink::TracingEventSink;
pub use types::{Event, KeyCheckedEvent, KeyDisabledEvent, KeyRateLimitedEvent};
