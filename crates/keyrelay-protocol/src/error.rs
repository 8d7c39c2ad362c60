/// Failures raised while decoding an upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The key hit a rate limit; it is locked out and the request re-enqueued.
    #[error("upstream rate limited the key: {0}")]
    RateLimited(String),
    /// The vendor is overloaded; the request is re-enqueued, the key is fine.
    #[error("upstream is overloaded: {0}")]
    Overloaded(String),
    /// The upstream rejected the request contents.
    #[error("upstream rejected the request: {0}")]
    BadRequest(String),
    #[error("upstream stream error {kind}: {message}")]
    Upstream { kind: String, message: String },
    #[error("malformed upstream stream: {0}")]
    Malformed(String),
}
