//! Seams for the collaborators that live outside the gateway: caller
//! identification and usage accounting.

use std::net::IpAddr;

use async_trait::async_trait;
use http::HeaderMap;
use tracing::info;

use crate::error::GatewayError;

/// Decides who is calling. The identifier keys concurrency limits.
pub trait Gatekeeper: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn identify(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<String, GatewayError>;
}

/// Bearer token, then `x-api-key`, then `x-risu-tk`, then the peer address.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGatekeeper;

impl Gatekeeper for DefaultGatekeeper {
    fn identify(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<String, GatewayError> {
        if let Some(token) = bearer_token(headers) {
            return Ok(token);
        }
        for name in ["x-api-key", "x-risu-tk"] {
            if let Some(value) = header_value(headers, name) {
                return Ok(value);
            }
        }
        peer.map(|ip| ip.to_string())
            .ok_or_else(|| GatewayError::BadRequest("unable to identify caller".to_string()))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = header_value(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// One finished (or partially streamed) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub identifier: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, usage: UsageRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, usage: UsageRecord) {
        info!(
            event = "usage",
            identifier = %usage.identifier,
            model = %usage.model,
            prompt_tokens = usage.prompt_tokens,
            output_tokens = usage.output_tokens,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn bearer_wins_over_risu_token_and_ip() {
        let ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let mut headers = HeaderMap::new();
        headers.insert("x-risu-tk", "risu".parse().unwrap());
        assert_eq!(DefaultGatekeeper.identify(&headers, ip).unwrap(), "risu");

        headers.insert("authorization", "Bearer sk-user".parse().unwrap());
        assert_eq!(DefaultGatekeeper.identify(&headers, ip).unwrap(), "sk-user");

        let headers = HeaderMap::new();
        assert_eq!(DefaultGatekeeper.identify(&headers, ip).unwrap(), "10.0.0.1");
        assert!(DefaultGatekeeper.identify(&headers, None).is_err());
    }
}
