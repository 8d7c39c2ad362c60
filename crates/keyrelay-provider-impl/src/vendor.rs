use async_trait::async_trait;
use keyrelay_common::{ApiFormat, Service};
use keyrelay_provider_core::{Headers, Key, ProxyRequestManager};

use crate::classify::{Classification, classify};
use crate::error::PrepareError;

/// What the dispatcher knows about the request being prepared.
#[derive(Debug, Clone, Copy)]
pub struct PrepareContext<'a> {
    pub model: &'a str,
    /// Dialect the upstream body is written in.
    pub format: ApiFormat,
    pub is_streaming: bool,
}

/// Vendor half of the dispatch pipeline: request rewriting, signing and error reading.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn service(&self) -> Service;

    /// Rewrites `request` for `key`. Every change goes through the manager so it
    /// can be reverted before a retry.
    async fn prepare(
        &self,
        key: &Key,
        ctx: &PrepareContext<'_>,
        request: &mut ProxyRequestManager<'_>,
    ) -> Result<(), PrepareError>;

    /// Response content type the vendor streams with.
    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    fn classify(&self, status: u16, headers: &Headers, body: &[u8]) -> Classification {
        classify(self.service(), status, headers, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    Sse,
    /// Binary `application/vnd.amazon.eventstream`.
    AwsEventStream,
}

pub(crate) fn unsupported(service: Service, format: ApiFormat) -> PrepareError {
    PrepareError::UnsupportedFormat {
        service,
        format: format.to_string(),
    }
}
