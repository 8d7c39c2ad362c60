//! HTTP surface of the gateway.

pub mod admin;
pub mod proxy;

use std::sync::Arc;

use axum::Router;
use keyrelay_core::Gateway;

pub use admin::admin_router;
pub use proxy::proxy_router;

/// Proxy endpoints plus `/health` and `/status`.
pub fn app_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .merge(proxy_router(gateway.clone()))
        .merge(admin_router(gateway))
}
