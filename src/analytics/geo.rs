//! Best-effort caller geolocation
//!
//! [`GeoResolver`] never fails: non-routable addresses short-circuit to
//! `None` without touching a backend, and backend errors or timeouts are
//! logged and also mapped to `None`.

use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analytics::models::GeoLocation;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geo request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geo service returned HTTP {0}")]
    Status(StatusCode),
    #[error("geo service could not resolve {ip}: {message}")]
    Unresolved { ip: IpAddr, message: String },
    #[error("no location data for {0}")]
    NotFound(IpAddr),
}

/// A source of IP geolocation
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

// SAFETY: .expect() on compile-time literal CIDRs, verified by tests.
static NON_ROUTABLE: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::/128",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .into_iter()
    .map(|cidr| cidr.parse().expect("non-routable CIDR must parse"))
    .collect()
});

/// Loopback, private, link-local and unspecified addresses
pub fn is_non_routable(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    NON_ROUTABLE.iter().any(|net| net.contains(&ip))
}

/// Geo resolution with private-range short-circuit and a lookup timeout
#[derive(Clone)]
pub struct GeoResolver {
    backend: Option<Arc<dyn GeoLookup>>,
    timeout: Duration,
}

impl GeoResolver {
    pub fn new(backend: Arc<dyn GeoLookup>, timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            timeout,
        }
    }

    /// A resolver that never looks anything up
    pub fn disabled() -> Self {
        Self {
            backend: None,
            timeout: Duration::ZERO,
        }
    }

    pub async fn resolve(&self, ip: IpAddr) -> Option<GeoLocation> {
        if is_non_routable(ip) {
            return None;
        }

        let backend = self.backend.as_ref()?;

        match tokio::time::timeout(self.timeout, backend.lookup(ip)).await {
            Ok(Ok(location)) => Some(location),
            Ok(Err(err)) => {
                debug!(%ip, error = %err, "geo lookup failed");
                None
            }
            Err(_) => {
                warn!(%ip, timeout_ms = self.timeout.as_millis() as u64, "geo lookup timed out");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

/// Lookup against an ip-api.com compatible JSON endpoint (`{base}/json/{ip}`)
pub struct IpApiLookup {
    client: Client,
    base_url: String,
}

impl IpApiLookup {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let response = self
            .client
            .get(format!("{}/json/{}", self.base_url, ip))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GeoError::Status(response.status()));
        }

        let body: IpApiResponse = response.json().await?;
        if body.status != "success" {
            return Err(GeoError::Unresolved {
                ip,
                message: body.message.unwrap_or(body.status),
            });
        }

        Ok(GeoLocation {
            city: body.city.filter(|s| !s.is_empty()),
            region: body.region_name.filter(|s| !s.is_empty()),
            country_code: body.country_code.filter(|s| !s.is_empty()),
            latitude: body.lat,
            longitude: body.lon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingLookup {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl GeoLookup for CountingLookup {
        async fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(GeoLocation {
                country_code: Some("NL".to_string()),
                ..Default::default()
            })
        }
    }

    fn counting(delay: Duration) -> Arc<CountingLookup> {
        Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[test]
    fn test_non_routable_ranges() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.0.10",
            "172.20.0.1",
            "169.254.1.1",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_non_routable(ip.parse().unwrap()), "{ip} should be non-routable");
        }

        for ip in ["8.8.8.8", "203.0.113.5", "2001:4860:4860::8888", "172.32.0.1"] {
            assert!(!is_non_routable(ip.parse().unwrap()), "{ip} should be routable");
        }
    }

    #[tokio::test]
    async fn test_private_addresses_skip_backend() {
        let backend = counting(Duration::ZERO);
        let resolver = GeoResolver::new(backend.clone(), Duration::from_secs(1));

        for ip in ["127.0.0.1", "10.0.0.8", "192.168.1.1", "::1"] {
            assert!(resolver.resolve(ip.parse().unwrap()).await.is_none());
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let location = resolver.resolve("8.8.8.8".parse().unwrap()).await;
        assert_eq!(location.unwrap().country_code.as_deref(), Some("NL"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_to_none() {
        let backend = counting(Duration::from_secs(5));
        let resolver = GeoResolver::new(backend.clone(), Duration::from_millis(50));

        assert!(resolver.resolve("8.8.8.8".parse().unwrap()).await.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_resolver() {
        let resolver = GeoResolver::disabled();
        assert!(resolver.resolve("8.8.8.8".parse().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_ip_api_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/8.8.8.8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "city": "Mountain View",
                "regionName": "California",
                "countryCode": "US",
                "lat": 37.386,
                "lon": -122.0838
            })))
            .mount(&server)
            .await;

        let lookup = IpApiLookup::new(Client::new(), &server.uri());
        let location = lookup.lookup("8.8.8.8".parse().unwrap()).await.unwrap();

        assert_eq!(location.city.as_deref(), Some("Mountain View"));
        assert_eq!(location.region.as_deref(), Some("California"));
        assert_eq!(location.country_code.as_deref(), Some("US"));
        assert_eq!(location.latitude, Some(37.386));
    }

    #[tokio::test]
    async fn test_ip_api_failures_resolve_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/203.0.113.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "fail",
                "message": "reserved range"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/json/203.0.113.2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let lookup = Arc::new(IpApiLookup::new(Client::new(), &server.uri()));

        let err = lookup.lookup("203.0.113.1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, GeoError::Unresolved { .. }));

        let err = lookup.lookup("203.0.113.2".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, GeoError::Status(StatusCode::SERVICE_UNAVAILABLE)));

        let resolver = GeoResolver::new(lookup, Duration::from_secs(1));
        assert!(resolver.resolve("203.0.113.1".parse().unwrap()).await.is_none());
        assert!(resolver.resolve("203.0.113.2".parse().unwrap()).await.is_none());
    }
}
