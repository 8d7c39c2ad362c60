use keyrelay_common::Service;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("failed to build signature: {0}")]
    Sign(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
}

/// Preparing an outbound request failed; the attempt is aborted without retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrepareError {
    #[error("{service} cannot serve {format} requests")]
    UnsupportedFormat { service: Service, format: String },
    #[error("key does not belong to {0}")]
    WrongKey(Service),
    #[error(transparent)]
    Signing(#[from] SigningError),
}
