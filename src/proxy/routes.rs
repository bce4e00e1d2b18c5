use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers::{health_check, proxy_request, ProxyState};

pub fn create_proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/{identifier}", any(proxy_request))
        .route("/{identifier}/", any(proxy_request))
        .route("/{identifier}/{*path}", any(proxy_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
