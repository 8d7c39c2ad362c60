use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use keyrelay_core::{ClientStream, Gateway, GatewayError, GatewayReply, ProxyResponse, ROUTES, RouteSpec};
use tracing::debug;

/// Largest request body accepted; image payloads can be large.
const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub gateway: Arc<Gateway>,
}

pub fn proxy_router(gateway: Arc<Gateway>) -> Router {
    let state = ProxyState { gateway };
    let mut router = Router::new();
    for (path, route) in ROUTES {
        let route = *route;
        let takes_action = path.ends_with("{model_action}");
        router = router.route(
            path,
            post(move |state: State<ProxyState>, req: Request| {
                proxy(state, route, takes_action, req)
            }),
        );
    }
    router.with_state(state)
}

async fn proxy(
    State(state): State<ProxyState>,
    route: RouteSpec,
    takes_action: bool,
    req: Request,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let model_action = takes_action
        .then(|| req.uri().path().rsplit('/').next().map(str::to_string))
        .flatten();
    let (parts, body) = req.into_parts();

    let body = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            debug!(event = "request_body_rejected", error = %err);
            return to_axum_response(
                GatewayError::BadRequest(format!("could not read request body: {err}"))
                    .into_response(route.inbound),
            );
        }
    };

    match state
        .gateway
        .handle(route, &parts.headers, peer, model_action, body)
        .await
    {
        GatewayReply::Blocking(response) => to_axum_response(response),
        GatewayReply::Stream(stream) => stream_response(stream),
    }
}

fn to_axum_response(resp: ProxyResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in resp.headers {
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

/// Streams always answer 200; failures arrive as in-band frames.
fn stream_response(stream: ClientStream) -> Response {
    let mut resp = Response::new(Body::from_stream(stream));
    let h = resp.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    // Hint common reverse proxies to avoid buffering SSE responses.
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
