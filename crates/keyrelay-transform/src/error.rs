use keyrelay_common::ApiFormat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("{0} responses cannot be converted")]
    Unsupported(ApiFormat),
    #[error("upstream {format} body is missing {field}")]
    MissingField {
        format: ApiFormat,
        field: &'static str,
    },
    #[error("{client} requests cannot be sent to a {upstream} upstream")]
    UnsupportedRequest { client: ApiFormat, upstream: ApiFormat },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("{0} has no streaming representation to aggregate")]
    Unsupported(ApiFormat),
}
