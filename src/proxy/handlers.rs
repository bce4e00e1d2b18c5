use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::error::ProxyError;
use super::forwarder::{build_target_url, relay_headers, split_proxy_path, Forwarder};
use super::ip_extractor::extract_client_ip;
use crate::config::ProxyConfig;
use crate::models::{Exchange, ExchangeRequest, ExchangeResponse};
use crate::storage::Storage;
use crate::telemetry::TelemetryPipeline;

pub struct ProxyState {
    pub storage: Arc<dyn Storage>,
    pub forwarder: Forwarder,
    pub pipeline: Arc<TelemetryPipeline>,
    pub config: ProxyConfig,
}

/// Relay a request to the origin registered for its identifier
///
/// The caller always gets the origin's status, headers and body; telemetry
/// is queued afterwards and never awaited.
pub async fn proxy_request(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let (identifier, sub_path) = split_proxy_path(parts.uri.path())
        .ok_or_else(|| ProxyError::RouteNotFound(String::new()))?;

    let route = state
        .storage
        .lookup_route(identifier)
        .await
        .map_err(|err| {
            error!(identifier, error = %err, "route lookup failed");
            ProxyError::Storage(err)
        })?
        .ok_or_else(|| ProxyError::RouteNotFound(identifier.to_string()))?;

    let limit = state.config.max_body_bytes;
    let body = to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::BodyTooLarge { limit })?;

    let query = parts.uri.query().map(str::to_string);
    let target = build_target_url(&route.origin_base_url, sub_path, query.as_deref())?;

    let upstream = state
        .forwarder
        .forward(target, parts.method.clone(), &parts.headers, body.clone())
        .await
        .map_err(|err| {
            warn!(identifier, tenant_id = %route.tenant_id, error = %err, "origin call failed");
            err
        })?;

    debug!(
        identifier,
        tenant_id = %route.tenant_id,
        status = upstream.status.as_u16(),
        duration_ms = upstream.duration_ms,
        "request relayed"
    );

    let mut response = Response::new(Body::from(upstream.body.clone()));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = relay_headers(&upstream.headers);

    let client_ip = extract_client_ip(&parts.headers, addr.ip(), &state.config);
    let exchange = Exchange {
        tenant_id: route.tenant_id,
        identifier: route.identifier,
        request: ExchangeRequest {
            method: parts.method,
            path: sub_path.to_string(),
            query,
            headers: parts.headers,
            body,
        },
        response: ExchangeResponse {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
        },
        duration_ms: upstream.duration_ms,
        client_ip,
        timestamp: Utc::now(),
    };

    // Rejections are logged by the pipeline; the response is already built
    let _ = state.pipeline.submit(exchange);

    Ok(response)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
