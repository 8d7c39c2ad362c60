//! Vendor stream transformers, client re-encoders, blocking body conversion and
//! the stream aggregator.

pub mod aggregator;
pub mod blocking;
pub mod encode;
pub mod error;
pub mod finish;
pub mod request;
pub mod stream;

pub use aggregator::EventAggregator;
pub use blocking::{CanonicalCompletion, convert_blocking};
pub use encode::ClientStreamEncoder;
pub use error::{AggregateError, TransformError};
pub use request::translate_request;
pub use stream::{
    AnthropicTextEvent, SseMessageTransformer, StreamEvent, TransformOutput, TransformParams,
    Transformer, select_transformer,
};
