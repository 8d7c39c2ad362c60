mod gcp_jwt;
mod sigv4;

pub use gcp_jwt::{AccessToken, DEFAULT_TOKEN_URI, GcpTokenSource, build_assertion, unix_now};
pub use sigv4::AwsSigner;
