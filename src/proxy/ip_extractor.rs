//! Caller IP extraction from HTTP headers with trust validation
//!
//! - Forwarding headers are only honoured in the configured trust mode
//! - `X-Forwarded-For` is walked right-to-left, skipping trusted hops
//! - Falls back to the socket address when headers are absent or untrusted
//! - Handles both IPv4 and IPv6

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{ProxyConfig, TrustedProxyMode};

/// Extract the caller IP address for an incoming request
pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &ProxyConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            if !is_trusted(socket_addr, config) {
                return socket_addr;
            }
            extract_from_forwarded(headers, config)
                .or_else(|| extract_from_x_forwarded_for(headers, config))
                .unwrap_or(socket_addr)
        }
        TrustedProxyMode::None => socket_addr,
    }
}

/// With no CIDR list configured every peer is trusted in Standard mode
fn is_trusted(ip: IpAddr, config: &ProxyConfig) -> bool {
    config.trusted_proxies.is_empty() || config.trusted_proxies.iter().any(|net| net.contains(&ip))
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Parse the `for=` node of an RFC 7239 element, stripping quotes, brackets and port
fn parse_forwarded_node(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');

    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    // IPv4 with port
    value.rsplit_once(':').and_then(|(host, _)| host.parse().ok())
}

/// RFC 7239 `Forwarded` header; the nearest untrusted hop wins
fn extract_from_forwarded(headers: &HeaderMap, config: &ProxyConfig) -> Option<IpAddr> {
    let forwarded = headers.get("forwarded")?.to_str().ok()?;

    let hops: Vec<IpAddr> = forwarded
        .split(',')
        .filter_map(|element| {
            element.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                if name.eq_ignore_ascii_case("for") {
                    parse_forwarded_node(value)
                } else {
                    None
                }
            })
        })
        .collect();

    select_hop(&hops, config)
}

/// `X-Forwarded-For` with right-to-left trust validation
fn extract_from_x_forwarded_for(headers: &HeaderMap, config: &ProxyConfig) -> Option<IpAddr> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;

    let hops: Vec<IpAddr> = xff
        .split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect();

    select_hop(&hops, config)
}

fn select_hop(hops: &[IpAddr], config: &ProxyConfig) -> Option<IpAddr> {
    if hops.is_empty() {
        return None;
    }

    // Skip a fixed number of trusted hops from the right
    if let Some(num_trusted) = config.num_trusted_proxies {
        if hops.len() > num_trusted {
            return Some(hops[hops.len() - num_trusted - 1]);
        }
        // Not enough hops in the chain, return the leftmost (least trusted)
        return hops.first().copied();
    }

    // First hop from the right that is not a trusted proxy
    if !config.trusted_proxies.is_empty() {
        return hops
            .iter()
            .rev()
            .find(|ip| !config.trusted_proxies.iter().any(|net| net.contains(*ip)))
            .or_else(|| hops.first())
            .copied();
    }

    hops.last().copied()
}
