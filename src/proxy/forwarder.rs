//! Relays one request to its origin and captures the full response

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use std::time::{Duration, Instant};

use super::error::ProxyError;
use crate::config::ProxyConfig;

/// Connection-level headers that describe one hop, not the message
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// A fully buffered origin response
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// From just before the request was sent until the response headers arrived
    pub duration_ms: i64,
}

pub struct Forwarder {
    client: Client,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(config.upstream_connect_timeout_secs))
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// Send the request once, without retries, and read the whole response
    pub async fn forward(
        &self,
        target: Url,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let mut outbound = strip_hop_by_hop(headers);
        outbound.remove(header::CONTENT_LENGTH);
        if let Some(authority) = authority(&target) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                outbound.insert(header::HOST, value);
            }
        }

        let mut request = self.client.request(method, target).headers(outbound);
        if !body.is_empty() {
            request = request.body(body);
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(ProxyError::UpstreamUnreachable)?;
        let duration_ms = started.elapsed().as_millis() as i64;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(ProxyError::UpstreamUnreachable)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            duration_ms,
        })
    }
}

/// `origin` with its trailing slashes trimmed, followed by `path` and `query`
pub fn build_target_url(origin: &str, path: &str, query: Option<&str>) -> Result<Url, ProxyError> {
    let mut target = format!(
        "{}/{}",
        origin.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }

    Url::parse(&target).map_err(|_| ProxyError::InvalidTarget(target))
}

/// Split a proxy request path into the route identifier and the sub-path
///
/// The sub-path always starts with '/', and is exactly "/" when the caller
/// addressed the identifier itself.
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (identifier, sub_path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };

    if identifier.is_empty() {
        return None;
    }
    Some((identifier, sub_path))
}

/// Response headers to hand back to the caller
///
/// The body is re-framed by our own server, so transfer framing and
/// connection management headers are dropped; `content-length` is kept
/// since the body is relayed byte-for-byte.
pub fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    strip_hop_by_hop(headers)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Headers named in `Connection` are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == header::HOST
            || HOP_BY_HOP.contains(&name.as_str())
            || listed.contains(name)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
