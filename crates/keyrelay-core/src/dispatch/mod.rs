//! One dispatch attempt per dequeued job: key selection, request preparation,
//! the upstream call and response normalization or error classification.

mod normalize;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use keyrelay_provider_core::{
    Headers, Key, KeyPoolError, KeyUpdate, OutboundRequest, ProxyRequestManager, UpstreamBody,
    UpstreamClient, UpstreamFailure, UpstreamHttpResponse,
};
use keyrelay_provider_impl::{
    Classification, ErrorAction, KeyEffect, PrepareContext, StreamFraming, VendorAdapter,
    VendorRegistry, count_text_tokens,
};
use keyrelay_protocol::StreamError;
use keyrelay_transform::{CanonicalCompletion, convert_blocking};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub use normalize::StreamNormalizer;

use crate::client::ClientSink;
use crate::collab::{UsageRecord, UsageSink};
use crate::error::GatewayError;
use crate::job::{ProxyContext, ProxyJob};
use crate::queue::{JobRunner, RequestQueue};
use crate::response::ProxyResponse;

/// How one attempt ended.
#[derive(Debug)]
enum Outcome {
    Completed { key: Key, output_tokens: u64 },
    /// The key was dealt with; the job goes back into the queue.
    Retry,
    Failed {
        error: GatewayError,
        /// Tokens already streamed before the failure.
        partial: Option<(Key, u64)>,
    },
    /// The client went away mid-response.
    Abandoned { key: Key, output_tokens: u64 },
}

impl Outcome {
    fn fail(error: GatewayError) -> Self {
        Outcome::Failed {
            error,
            partial: None,
        }
    }
}

pub struct Dispatcher {
    queue: RequestQueue,
    registry: Arc<VendorRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    usage: Arc<dyn UsageSink>,
}

impl Dispatcher {
    pub fn new(
        queue: RequestQueue,
        registry: Arc<VendorRegistry>,
        upstream: Arc<dyn UpstreamClient>,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            queue,
            registry,
            upstream,
            usage,
        }
    }

    async fn attempt(&self, job: &ProxyJob) -> Outcome {
        let ctx = &job.ctx;
        let pool = self.registry.pool();
        let key = match pool
            .get(&ctx.model, Some(ctx.service), ctx.needs_multimodal)
            .await
        {
            Ok(key) => key,
            Err(err) => return Outcome::fail(pool_error(err, ctx)),
        };
        let Some(adapter) = self.registry.adapter(ctx.service) else {
            return Outcome::fail(GatewayError::NoKeysAvailable {
                family: ctx.family,
                over_quota: false,
            });
        };

        info!(
            event = "proxy_dispatch",
            request_id = %ctx.request_id,
            service = %ctx.service,
            model = %ctx.model,
            key = %key.id,
            retry = job.retry_count,
            "dispatching request"
        );

        let mut outbound = OutboundRequest::post("", ctx.body.clone());
        outbound.headers = ctx.headers.clone();
        let mut manager = ProxyRequestManager::new(&mut outbound);
        let prepare = PrepareContext {
            model: &ctx.model,
            format: ctx.outbound,
            is_streaming: ctx.is_streaming,
        };
        if let Err(err) = adapter.prepare(&key, &prepare, &mut manager).await {
            warn!(
                event = "proxy_prepare_failed",
                request_id = %ctx.request_id,
                error = %err,
            );
            return Outcome::fail(GatewayError::Preparation(err.to_string()));
        }

        let sent = self
            .upstream
            .send(manager.request().into_http(ctx.is_streaming))
            .await;
        manager.revert();

        let response = match sent {
            Ok(response) => response,
            Err(UpstreamFailure::Transport { kind, message }) => {
                warn!(
                    event = "proxy_network_error",
                    request_id = %ctx.request_id,
                    kind = ?kind,
                    error = %message,
                );
                return Outcome::fail(GatewayError::Network { kind, message });
            }
            Err(UpstreamFailure::Http {
                status,
                headers,
                body,
            }) => {
                return self
                    .handle_error(&key, adapter.as_ref(), ctx, status, &headers, &body)
                    .await;
            }
        };

        if !response.is_success() {
            let status = response.status;
            let headers = response.headers.clone();
            let body = match response.into_bytes().await {
                Ok(body) => body,
                Err(err) => return Outcome::fail(transport_error(err)),
            };
            return self
                .handle_error(&key, adapter.as_ref(), ctx, status, &headers, &body)
                .await;
        }

        pool.update_rate_limits(&key, &response.headers).await;
        if ctx.is_streaming
            && let Some(sink) = job.client.sink()
        {
            self.relay_stream(key, adapter.stream_framing(), ctx, sink, response)
                .await
        } else {
            self.relay_blocking(key, job, response).await
        }
    }

    async fn handle_error(
        &self,
        key: &Key,
        adapter: &dyn VendorAdapter,
        ctx: &ProxyContext,
        status: u16,
        headers: &Headers,
        body: &[u8],
    ) -> Outcome {
        let Classification {
            action,
            note,
            error,
        } = adapter.classify(status, headers, body);
        warn!(
            event = "upstream_error",
            request_id = %ctx.request_id,
            key = %key.id,
            status,
            kind = %error.kind,
            detail = %error.message,
            action = ?action,
        );

        match action {
            ErrorAction::Retry(effect) => {
                self.apply_effect(key, ctx, effect).await;
                Outcome::Retry
            }
            ErrorAction::Fail => {
                let payload = serde_json::from_slice(body).unwrap_or_else(|_| {
                    json!({"message": String::from_utf8_lossy(body)})
                });
                Outcome::fail(GatewayError::Upstream {
                    status,
                    payload,
                    note,
                })
            }
        }
    }

    async fn apply_effect(&self, key: &Key, ctx: &ProxyContext, effect: KeyEffect) {
        let pool = self.registry.pool();
        match effect {
            KeyEffect::None => {}
            KeyEffect::RateLimit => pool.mark_rate_limited(key).await,
            KeyEffect::Disable(reason) => pool.disable(key, reason).await,
            KeyEffect::RemoveFamily => {
                let mut families = key.model_families.clone();
                families.remove(&ctx.family);
                pool.update(
                    key,
                    KeyUpdate {
                        model_families: Some(families),
                        ..KeyUpdate::default()
                    },
                )
                .await;
            }
        }
    }

    async fn relay_blocking(&self, key: Key, job: &ProxyJob, response: UpstreamHttpResponse) -> Outcome {
        let ctx = &job.ctx;
        let status = response.status;
        let body = match response.into_bytes().await {
            Ok(body) => body,
            Err(err) => return Outcome::fail(transport_error(err)),
        };
        let upstream: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return Outcome::fail(GatewayError::Internal(format!(
                    "upstream returned invalid JSON: {err}"
                )));
            }
        };

        let output_tokens = CanonicalCompletion::from_upstream(ctx.outbound, &upstream)
            .map(|completion| completion_tokens(&completion, ctx))
            .unwrap_or_default();
        let converted = match convert_blocking(ctx.outbound, ctx.inbound, upstream) {
            Ok(converted) => converted,
            Err(err) => return Outcome::fail(GatewayError::Internal(err.to_string())),
        };

        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        job.client
            .respond(ProxyResponse::json(status, &converted))
            .await;
        Outcome::Completed { key, output_tokens }
    }

    async fn relay_stream(
        &self,
        key: Key,
        framing: StreamFraming,
        ctx: &ProxyContext,
        sink: &ClientSink,
        response: UpstreamHttpResponse,
    ) -> Outcome {
        let mut normalizer =
            StreamNormalizer::new(framing, ctx.outbound, ctx.inbound, &ctx.request_id, &ctx.model);
        let mut body = response.body;

        loop {
            let chunk = match &mut body {
                UpstreamBody::Stream(rx) => rx.recv().await,
                UpstreamBody::Bytes(bytes) => {
                    let bytes = std::mem::take(bytes);
                    (!bytes.is_empty()).then_some(Ok(bytes))
                }
            };
            let chunk: Bytes = match chunk {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    let output_tokens = streamed_tokens(&normalizer, ctx);
                    return Outcome::Failed {
                        error: transport_error(err),
                        partial: Some((key, output_tokens)),
                    };
                }
            };
            let frames = match normalizer.push(&chunk) {
                Ok(frames) => frames,
                Err(err) => return self.stream_failure(key, ctx, &normalizer, err).await,
            };
            if !write_all(sink, frames).await {
                return abandoned(key, &normalizer, ctx);
            }
        }

        let frames = match normalizer.finish() {
            Ok(frames) => frames,
            Err(err) => return self.stream_failure(key, ctx, &normalizer, err).await,
        };
        if !write_all(sink, frames).await {
            return abandoned(key, &normalizer, ctx);
        }
        Outcome::Completed {
            output_tokens: streamed_tokens(&normalizer, ctx),
            key,
        }
    }

    async fn stream_failure(
        &self,
        key: Key,
        ctx: &ProxyContext,
        normalizer: &StreamNormalizer,
        err: StreamError,
    ) -> Outcome {
        warn!(
            event = "upstream_stream_error",
            request_id = %ctx.request_id,
            key = %key.id,
            error = %err,
            emitted = normalizer.has_emitted(),
        );
        if !normalizer.has_emitted() {
            match &err {
                StreamError::RateLimited(_) => {
                    self.registry.pool().mark_rate_limited(&key).await;
                    return Outcome::Retry;
                }
                StreamError::Overloaded(_) => return Outcome::Retry,
                _ => {}
            }
        }
        let error = match err {
            StreamError::RateLimited(message) | StreamError::Overloaded(message) => {
                GatewayError::Retryable(message)
            }
            StreamError::BadRequest(message) => GatewayError::BadRequest(message),
            StreamError::Upstream { kind, message } => GatewayError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                payload: json!({"type": kind, "message": message}),
                note: Some("the upstream stream ended with an error".to_string()),
            },
            StreamError::Malformed(message) => GatewayError::Internal(message),
        };
        Outcome::Failed {
            error,
            partial: Some((key, streamed_tokens(normalizer, ctx))),
        }
    }

    async fn account(&self, job: &ProxyJob, key: &Key, output_tokens: u64) {
        let ctx = &job.ctx;
        self.registry
            .pool()
            .increment_usage(key, &ctx.model, ctx.prompt_tokens + output_tokens)
            .await;
        self.usage
            .record(UsageRecord {
                identifier: ctx.identifier.clone(),
                model: ctx.model.clone(),
                prompt_tokens: ctx.prompt_tokens,
                output_tokens,
            })
            .await;
    }
}

#[async_trait]
impl JobRunner for Dispatcher {
    async fn run(&self, job: ProxyJob) {
        match self.attempt(&job).await {
            Outcome::Completed { key, output_tokens } => {
                self.account(&job, &key, output_tokens).await;
                self.queue.track_wait_time(&job);
                debug!(
                    event = "proxy_complete",
                    request_id = %job.ctx.request_id,
                    output_tokens,
                );
            }
            Outcome::Abandoned { key, output_tokens } => {
                self.account(&job, &key, output_tokens).await;
                info!(
                    event = "proxy_client_left",
                    request_id = %job.ctx.request_id,
                    "client disconnected during response"
                );
            }
            Outcome::Retry => self.queue.reenqueue(job),
            Outcome::Failed { error, partial } => {
                if let Some((key, output_tokens)) = partial {
                    self.account(&job, &key, output_tokens).await;
                }
                job.client
                    .fail(&error, job.ctx.inbound, &job.ctx.model)
                    .await;
            }
        }
    }
}

async fn write_all(sink: &ClientSink, frames: Vec<String>) -> bool {
    for frame in frames {
        if !sink.write(frame).await {
            return false;
        }
    }
    true
}

fn completion_tokens(completion: &CanonicalCompletion, ctx: &ProxyContext) -> u64 {
    completion
        .output_tokens
        .unwrap_or_else(|| count_text_tokens(&ctx.model, &completion.text))
}

/// Output tokens of everything streamed so far, read back from the merged body.
fn streamed_tokens(normalizer: &StreamNormalizer, ctx: &ProxyContext) -> u64 {
    let aggregator = normalizer.aggregator();
    match aggregator.get_final_response() {
        Ok(body) => match CanonicalCompletion::from_upstream(aggregator.body_format(), &body) {
            Ok(completion) => completion_tokens(&completion, ctx),
            Err(err) => {
                debug!(event = "stream_usage_fallback", request_id = %ctx.request_id, error = %err);
                count_text_tokens(&ctx.model, &aggregator.text())
            }
        },
        Err(_) => count_text_tokens(&ctx.model, &aggregator.text()),
    }
}

fn abandoned(key: Key, normalizer: &StreamNormalizer, ctx: &ProxyContext) -> Outcome {
    Outcome::Abandoned {
        output_tokens: streamed_tokens(normalizer, ctx),
        key,
    }
}

fn transport_error(err: UpstreamFailure) -> GatewayError {
    match err {
        UpstreamFailure::Transport { kind, message } => GatewayError::Network { kind, message },
        UpstreamFailure::Http { status, body, .. } => GatewayError::Upstream {
            status,
            payload: serde_json::from_slice(&body).unwrap_or(Value::Null),
            note: None,
        },
    }
}

fn pool_error(err: KeyPoolError, ctx: &ProxyContext) -> GatewayError {
    match err {
        KeyPoolError::NoKeysAvailable {
            family, over_quota, ..
        } => GatewayError::NoKeysAvailable { family, over_quota },
        KeyPoolError::ServiceNotConfigured(_) => GatewayError::NoKeysAvailable {
            family: ctx.family,
            over_quota: false,
        },
        KeyPoolError::UnknownModel(model) => {
            GatewayError::BadRequest(format!("unknown model {model}"))
        }
        other @ KeyPoolError::InvalidSecret { .. } => GatewayError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_common::{ApiFormat, ModelFamily, Service};

    use super::*;

    fn context(model: &str, format: ApiFormat, family: ModelFamily) -> ProxyContext {
        ProxyContext {
            request_id: "req-usage".to_string(),
            identifier: "tester".to_string(),
            service: family.service(),
            inbound: format,
            outbound: format,
            model: model.to_string(),
            family,
            is_streaming: true,
            needs_multimodal: false,
            prompt_tokens: 0,
            output_tokens: 0,
            headers: Vec::new(),
            body: json!({}),
        }
    }

    #[test]
    fn streamed_usage_is_read_from_the_merged_body() {
        let ctx = context("gemini-pro", ApiFormat::GoogleAI, ModelFamily::GeminiPro);
        let mut normalizer = StreamNormalizer::new(
            StreamFraming::Sse,
            ApiFormat::GoogleAI,
            ApiFormat::GoogleAI,
            "req-usage",
            "gemini-pro",
        );
        for text in ["Hello", " there, ", "friend"] {
            let frame = format!(
                "data: {}\n\n",
                json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
            );
            normalizer.push(frame.as_bytes()).unwrap();
        }
        // "Hello there, friend" is 19 chars.
        assert_eq!(streamed_tokens(&normalizer, &ctx), 5);
        assert_eq!(
            normalizer.aggregator().get_final_response().unwrap()["choices"][0]["message"]["content"],
            "Hello there, friend"
        );
        assert_eq!(ctx.service, Service::GoogleAI);
    }

    #[test]
    fn empty_stream_costs_nothing() {
        let ctx = context(
            "claude-3-haiku-20240307",
            ApiFormat::AnthropicChat,
            ModelFamily::Claude,
        );
        let normalizer = StreamNormalizer::new(
            StreamFraming::Sse,
            ApiFormat::AnthropicChat,
            ApiFormat::AnthropicChat,
            "req-usage",
            "claude-3-haiku-20240307",
        );
        assert_eq!(streamed_tokens(&normalizer, &ctx), 0);
    }
}
