//! Wire-level building blocks: SSE framing, AWS event-stream decoding and the
//! canonical chunk shape every vendor stream is normalized to.

pub mod aws_eventstream;
pub mod canonical;
pub mod error;
pub mod sse;

pub use aws_eventstream::{EventStreamDecoder, EventStreamMessage, HeaderValue, aws_message_to_sse};
pub use canonical::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
pub use error::StreamError;
pub use sse::{ServerSentEvent, SseFramer, encode_comment, encode_sse, is_comment_only};
