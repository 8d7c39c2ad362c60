use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use keyrelay_core::Gateway;

#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
}

pub fn admin_router(gateway: Arc<Gateway>) -> Router {
    let state = AdminState { gateway };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.status().await)
}
