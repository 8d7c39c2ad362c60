use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use keyrelay_common::GatewayConfig;
use keyrelay_core::{DefaultGatekeeper, Gateway, TracingUsageSink};
use keyrelay_provider_core::{
    UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
};
use keyrelay_router::app_router;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Answers every request with the same Anthropic message.
#[derive(Default)]
struct CannedClient {
    urls: Mutex<Vec<String>>,
}

impl UpstreamClient for CannedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.urls.lock().unwrap().push(req.url);
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-haiku-20240307",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        });
        Box::pin(async move {
            Ok(UpstreamHttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
            })
        })
    }
}

async fn gateway() -> (Arc<Gateway>, Arc<CannedClient>) {
    let config = GatewayConfig::from_json_str(
        r#"{"keys": {"anthropic": ["sk-ant-router"]}, "checks": {"enabled": false}}"#,
    )
    .unwrap();
    let upstream = Arc::new(CannedClient::default());
    let gateway = Gateway::launch(
        &config,
        upstream.clone(),
        Arc::new(DefaultGatekeeper),
        Arc::new(TracingUsageSink),
    )
    .await
    .unwrap();
    (Arc::new(gateway), upstream)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer client-token")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (gateway, _) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({"ok": true}));
}

#[tokio::test]
async fn blocking_messages_request_is_proxied() {
    let (gateway, upstream) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(post_json(
            "/proxy/anthropic/v1/messages",
            &json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "ping"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["content"][0]["text"], "pong");
    assert_eq!(upstream.urls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn openai_dialect_route_translates_the_reply() {
    let (gateway, _) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(post_json(
            "/proxy/anthropic/v1/chat/completions",
            &json!({
                "model": "claude-3-haiku-20240307",
                "messages": [{"role": "user", "content": "ping"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let (gateway, upstream) = gateway().await;
    let req = Request::builder()
        .method("POST")
        .uri("/proxy/anthropic/v1/messages")
        .header(header::AUTHORIZATION, "Bearer client-token")
        .body(Body::from("not json"))
        .unwrap();
    let resp = app_router(gateway).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["type"], "error");
    assert!(upstream.urls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn streaming_request_gets_an_event_stream() {
    let (gateway, _) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(post_json(
            "/proxy/anthropic/v1/messages",
            &json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 16,
                "stream": true,
                "messages": [{"role": "user", "content": "ping"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
}

#[tokio::test]
async fn status_lists_configured_keys() {
    let (gateway, _) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["queue"]["length"], 0);
    assert_eq!(body["keys"]["anthropic"]["total"], 1);
    assert_eq!(body["keys"]["anthropic"]["active"], 1);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (gateway, _) = gateway().await;
    let resp = app_router(gateway)
        .oneshot(post_json("/proxy/nowhere/v1/chat", &json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
