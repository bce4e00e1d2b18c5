use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub proxy_server: ServerConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub geo: GeoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How far forwarding headers are trusted when deriving the caller IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket address only
    None,
    /// Honour `Forwarded` / `X-Forwarded-For`
    Standard,
    /// Honour `CF-Connecting-IP`
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Largest request body relayed to an origin
    pub max_body_bytes: usize,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_timeout_secs: u64,
    pub trusted_proxy_mode: TrustedProxyMode,
    /// Proxies whose forwarding headers are trusted (Standard mode)
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
    /// Number of trusted hops at the right end of X-Forwarded-For
    #[serde(default)]
    pub num_trusted_proxies: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            upstream_connect_timeout_secs: 10,
            upstream_timeout_secs: 30,
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: Vec::new(),
            num_trusted_proxies: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Fixed number of pipeline workers
    pub workers: usize,
    /// Bounded queue between the proxy and the workers
    pub queue_capacity: usize,
    /// Number of single-writer aggregation shards
    pub aggregator_shards: usize,
    pub aggregator_shard_buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
            aggregator_shards: 8,
            aggregator_shard_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoProvider {
    None,
    IpApi,
    MaxMind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    pub provider: GeoProvider,
    pub api_url: String,
    pub timeout_ms: u64,
    /// Path to a GeoLite2-City / GeoIP2-City .mmdb file
    pub city_db_path: Option<String>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider: GeoProvider::IpApi,
            api_url: "http://ip-api.com".to_string(),
            timeout_ms: 1500,
            city_db_path: None,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match env_or("DATABASE_BACKEND", "sqlite").to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database_url = env_or("DATABASE_URL", "sqlite://./vantage.db?mode=rwc");
        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 5u32)?;

        let proxy_host = env_or("PROXY_HOST", "127.0.0.1");
        let proxy_port = env_parse("PROXY_PORT", 8080u16)?;

        let proxy_defaults = ProxyConfig::default();

        let trusted_proxy_mode = match env_or("TRUSTED_PROXY_MODE", "none")
            .to_lowercase()
            .as_str()
        {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = env_or("TRUSTED_PROXIES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpNet>()
                    .or_else(|_| s.parse::<std::net::IpAddr>().map(IpNet::from))
                    .with_context(|| format!("TRUSTED_PROXIES entry '{s}' is not an IP or CIDR"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .map(|v| {
                v.parse::<usize>()
                    .with_context(|| format!("NUM_TRUSTED_PROXIES has an invalid value '{v}'"))
            })
            .transpose()?;

        let proxy = ProxyConfig {
            max_body_bytes: env_parse("PROXY_MAX_BODY_BYTES", proxy_defaults.max_body_bytes)?,
            upstream_connect_timeout_secs: env_parse(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                proxy_defaults.upstream_connect_timeout_secs,
            )?,
            upstream_timeout_secs: env_parse(
                "UPSTREAM_TIMEOUT_SECS",
                proxy_defaults.upstream_timeout_secs,
            )?,
            trusted_proxy_mode,
            trusted_proxies,
            num_trusted_proxies,
        };

        let cache = CacheConfig {
            max_entries: env_parse("ROUTE_CACHE_MAX_ENTRIES", 10_000u64)?,
            ttl_secs: env_parse("ROUTE_CACHE_TTL_SECS", 300u64)?,
        };

        let telemetry_defaults = TelemetryConfig::default();
        let telemetry = TelemetryConfig {
            workers: env_parse("TELEMETRY_WORKERS", telemetry_defaults.workers)?.max(1),
            queue_capacity: env_parse(
                "TELEMETRY_QUEUE_CAPACITY",
                telemetry_defaults.queue_capacity,
            )?
            .max(1),
            aggregator_shards: env_parse(
                "AGGREGATOR_SHARDS",
                telemetry_defaults.aggregator_shards,
            )?
            .max(1),
            aggregator_shard_buffer: env_parse(
                "AGGREGATOR_SHARD_BUFFER",
                telemetry_defaults.aggregator_shard_buffer,
            )?
            .max(1),
        };

        let geo_defaults = GeoConfig::default();
        let city_db_path = std::env::var("GEOIP_CITY_DB_PATH").ok();
        let provider = match std::env::var("GEO_PROVIDER") {
            Ok(value) => match value.to_lowercase().as_str() {
                "none" | "disabled" => GeoProvider::None,
                "ip-api" | "ipapi" => GeoProvider::IpApi,
                "maxmind" => GeoProvider::MaxMind,
                other => {
                    tracing::warn!(
                        "Unknown GEO_PROVIDER '{other}', falling back to 'ip-api'. Supported values: none, ip-api, maxmind"
                    );
                    GeoProvider::IpApi
                }
            },
            // A configured database implies the local provider
            Err(_) if city_db_path.is_some() => GeoProvider::MaxMind,
            Err(_) => geo_defaults.provider,
        };

        if provider == GeoProvider::MaxMind && city_db_path.is_none() {
            anyhow::bail!("GEOIP_CITY_DB_PATH must be set when GEO_PROVIDER=maxmind");
        }

        let geo = GeoConfig {
            provider,
            api_url: env_or("GEO_API_URL", &geo_defaults.api_url),
            timeout_ms: env_parse("GEO_TIMEOUT_MS", geo_defaults.timeout_ms)?,
            city_db_path,
        };

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            proxy_server: ServerConfig {
                host: proxy_host,
                port: proxy_port,
            },
            proxy,
            cache,
            telemetry,
            geo,
        })
    }
}
