use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::net::IpAddr;

use crate::analytics::GeoLocation;
use crate::security::{SecurityFinding, SecurityReport};

/// Header name/value pairs in wire order; repeated names stay repeated
pub type HeaderList = Vec<(String, String)>;

pub fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Request half of an exchange as the proxy received it
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub method: Method,
    /// Sub-path relayed to the origin, always starting with '/'
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response half of an exchange as the origin returned it
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A completed proxied call, not yet enriched or persisted
#[derive(Debug, Clone)]
pub struct Exchange {
    pub tenant_id: String,
    pub identifier: String,
    pub request: ExchangeRequest,
    pub response: ExchangeResponse,
    pub duration_ms: i64,
    pub client_ip: IpAddr,
    /// When the origin response completed
    pub timestamp: DateTime<Utc>,
}

impl Exchange {
    pub fn user_agent(&self) -> Option<String> {
        self.request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Persisted form of an exchange plus its derived telemetry
///
/// Bodies are stored as opaque bytes; structured views are only built on
/// demand through [`ExchangeRecord::request_json`] and
/// [`ExchangeRecord::response_json`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExchangeRecord {
    pub id: i64,
    pub tenant_id: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: i32,
    pub duration_ms: i64,
    pub request_size: i64,
    pub response_size: i64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub request_headers: Json<HeaderList>,
    #[serde(skip)]
    pub request_body: Vec<u8>,
    pub response_headers: Json<HeaderList>,
    #[serde(skip)]
    pub response_body: Vec<u8>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub security_score: i32,
    pub findings: Json<Vec<SecurityFinding>>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

impl ExchangeRecord {
    /// Build the record for an exchange; `id` is assigned by the store on insert.
    pub fn from_exchange(
        exchange: &Exchange,
        geo: Option<&GeoLocation>,
        report: &SecurityReport,
    ) -> Self {
        Self {
            id: 0,
            tenant_id: exchange.tenant_id.clone(),
            method: exchange.request.method.to_string(),
            path: exchange.request.path.clone(),
            query: exchange.request.query.clone(),
            status: i32::from(exchange.response.status.as_u16()),
            duration_ms: exchange.duration_ms,
            request_size: exchange.request.body.len() as i64,
            response_size: exchange.response.body.len() as i64,
            client_ip: exchange.client_ip.to_string(),
            user_agent: exchange.user_agent(),
            request_headers: Json(header_list(&exchange.request.headers)),
            request_body: exchange.request.body.to_vec(),
            response_headers: Json(header_list(&exchange.response.headers)),
            response_body: exchange.response.body.to_vec(),
            city: geo.and_then(|g| g.city.clone()),
            region: geo.and_then(|g| g.region.clone()),
            country_code: geo.and_then(|g| g.country_code.clone()),
            latitude: geo.and_then(|g| g.latitude),
            longitude: geo.and_then(|g| g.longitude),
            security_score: report.score,
            findings: Json(report.findings.clone()),
            created_at: exchange.timestamp.timestamp_millis(),
        }
    }

    pub fn request_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.request_body).ok()
    }

    pub fn response_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.response_body).ok()
    }
}
