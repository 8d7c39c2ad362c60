use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use keyrelay_common::UpstreamConfig;
use keyrelay_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};

/// Chunks buffered between the upstream reader and the dispatcher.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_config(upstream: &UpstreamConfig, proxy: Option<String>) -> Self {
        Self {
            proxy: normalize_proxy(proxy),
            connect_timeout: Duration::from_millis(upstream.connect_timeout_ms),
            request_timeout: Duration::from_millis(upstream.request_timeout_ms),
            stream_idle_timeout: Duration::from_millis(upstream.stream_idle_timeout_ms),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default(), None)
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = build_client(&config)?;
        Ok(Self { config, client })
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = config.proxy.as_deref() {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = http_method_to_wreq(req.method);
            let mut builder = self.client.request(method, &req.url);

            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }

            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, UpstreamFailure>>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let item = match tokio::time::timeout(stream_idle_timeout, stream.next()).await {
                Ok(Some(item)) => item.map_err(map_wreq_error),
                Ok(None) => break,
                Err(_) => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::ReadTimeout,
                    message: format!("no data from upstream for {stream_idle_timeout:?}"),
                }),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_timeouts_and_blank_proxy() {
        let upstream = UpstreamConfig {
            connect_timeout_ms: 1_500,
            request_timeout_ms: 60_000,
            stream_idle_timeout_ms: 30_000,
        };
        let config = UpstreamClientConfig::from_config(&upstream, Some("  ".to_string()));
        assert_eq!(config.proxy, None);
        assert_eq!(config.connect_timeout, Duration::from_millis(1_500));
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(30));

        let config = UpstreamClientConfig::from_config(
            &upstream,
            Some(" socks5://127.0.0.1:1080 ".to_string()),
        );
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
    }
}
