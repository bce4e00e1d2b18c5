use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vantage::analytics::{AnalyticsAggregator, GeoResolver, IpApiLookup, MaxMindLookup};
use vantage::config::{Config, GeoConfig, GeoProvider};
use vantage::proxy::{create_proxy_router, Forwarder, ProxyState};
use vantage::storage::{self, CachedStorage, Storage};
use vantage::telemetry::TelemetryPipeline;

fn build_geo_resolver(config: &GeoConfig) -> Result<GeoResolver> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let resolver = match config.provider {
        GeoProvider::None => {
            info!("Geo resolution disabled");
            GeoResolver::disabled()
        }
        GeoProvider::IpApi => {
            info!("Geo resolution via {}", config.api_url);
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            GeoResolver::new(Arc::new(IpApiLookup::new(client, &config.api_url)), timeout)
        }
        GeoProvider::MaxMind => {
            let path = config
                .city_db_path
                .as_deref()
                .context("GEOIP_CITY_DB_PATH is required for the maxmind provider")?;
            info!("Geo resolution via MaxMind database {}", path);
            GeoResolver::new(Arc::new(MaxMindLookup::new(path)?), timeout)
        }
    };

    Ok(resolver)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    let backing = storage::open(&config.database).await?;
    info!("Database initialized successfully");

    let storage: Arc<dyn Storage> = Arc::new(CachedStorage::new(
        Arc::clone(&backing),
        config.cache.max_entries,
        config.cache.ttl_secs,
    ));

    let aggregator = Arc::new(AnalyticsAggregator::new(
        Arc::clone(&backing),
        config.telemetry.aggregator_shards,
        config.telemetry.aggregator_shard_buffer,
    ));

    let pipeline = Arc::new(TelemetryPipeline::new(
        Arc::clone(&backing),
        build_geo_resolver(&config.geo)?,
        aggregator,
        &config.telemetry,
    ));

    let state = Arc::new(ProxyState {
        storage,
        forwarder: Forwarder::new(&config.proxy)?,
        pipeline: Arc::clone(&pipeline),
        config: config.proxy.clone(),
    });
    let router = create_proxy_router(state);

    let addr = format!("{}:{}", config.proxy_server.host, config.proxy_server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Proxy listening on http://{}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(
        pending = pipeline.pending(),
        "Shutting down, draining telemetry..."
    );
    pipeline.drain().await;
    info!("Telemetry drained");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
