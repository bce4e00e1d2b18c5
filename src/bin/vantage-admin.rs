use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use vantage::config::Config;
use vantage::models::NewRoute;
use vantage::storage::{self, StorageError};

#[derive(Parser)]
#[command(name = "vantage-admin")]
#[command(about = "Vantage route and telemetry management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new proxied API
    AddRoute {
        /// Public identifier, the first path segment on the proxy
        identifier: String,
        /// Origin base URL requests are relayed to
        origin: String,
        /// Tenant id used for telemetry (defaults to the identifier)
        #[arg(long)]
        tenant_id: Option<String>,
        /// Owning account
        #[arg(long)]
        owner: Option<String>,
    },
    /// Remove a route together with its exchanges and aggregates
    RemoveRoute {
        identifier: String,
    },
    /// List registered routes
    Routes {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show recent exchanges of a tenant, newest first
    Exchanges {
        tenant_id: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show the daily and hourly aggregates of a tenant
    Stats {
        tenant_id: String,
        /// UTC date as YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Opening also ensures the schema exists
    let storage = storage::open(&config.database).await?;

    match cli.command {
        Commands::AddRoute {
            identifier,
            origin,
            tenant_id,
            owner,
        } => {
            let route = NewRoute {
                tenant_id: tenant_id.unwrap_or_else(|| identifier.clone()),
                identifier,
                origin_base_url: origin,
                owner,
            };
            route.validate()?;

            match storage.create_route(&route).await {
                Ok(created) => println!(
                    "✓ Route '{}' -> {} (tenant '{}')",
                    created.identifier, created.origin_base_url, created.tenant_id
                ),
                Err(StorageError::Conflict) => anyhow::bail!(
                    "identifier '{}' or tenant '{}' is already registered",
                    route.identifier,
                    route.tenant_id
                ),
                Err(StorageError::Other(err)) => return Err(err),
            }
        }
        Commands::RemoveRoute { identifier } => {
            if storage.delete_route(&identifier).await? {
                println!("✓ Removed route '{}' and its telemetry", identifier);
            } else {
                println!("⚠ Route '{}' does not exist", identifier);
            }
        }
        Commands::Routes { owner } => {
            let routes = storage.list_routes(owner.as_deref()).await?;
            if routes.is_empty() {
                println!("No routes registered.");
            } else {
                println!("{:<24} {:<24} {:<16} {}", "Identifier", "Tenant", "Owner", "Origin");
                println!("{}", "-".repeat(96));
                for route in routes {
                    println!(
                        "{:<24} {:<24} {:<16} {}",
                        route.identifier,
                        route.tenant_id,
                        route.owner.as_deref().unwrap_or("-"),
                        route.origin_base_url
                    );
                }
            }
        }
        Commands::Exchanges {
            tenant_id,
            limit,
            offset,
        } => {
            let records = storage.list_exchanges(&tenant_id, limit, offset).await?;
            if records.is_empty() {
                println!("No exchanges recorded for '{}'.", tenant_id);
            }
            for record in records {
                let at = chrono::DateTime::from_timestamp_millis(record.created_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "{} {:<7} {:<40} {} {:>6}ms score={:<3} {} {}",
                    at,
                    record.method,
                    record.path,
                    record.status,
                    record.duration_ms,
                    record.security_score,
                    record.client_ip,
                    record.country_code.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Stats { tenant_id, date } => {
            let date = match date {
                Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("'{}' is not a YYYY-MM-DD date", raw))?,
                None => Utc::now().date_naive(),
            };

            let buckets = storage.list_buckets(&tenant_id, date).await?;
            if buckets.is_empty() {
                println!("No aggregates for '{}' on {}.", tenant_id, date);
            } else {
                println!(
                    "{:<6} {:>8} {:>7} {:>6} {:>9} {:>7} {:>7} {:>6} {:>5} {:>5}",
                    "Hour", "Requests", "Errors", "Err%", "Avg ms", "Min", "Max", "Score", "IPs", "Ctry"
                );
                println!("{}", "-".repeat(79));
                for bucket in buckets {
                    let hour = bucket
                        .key
                        .hour
                        .map(|h| format!("{:02}h", h))
                        .unwrap_or_else(|| "day".to_string());
                    println!(
                        "{:<6} {:>8} {:>7} {:>6.1} {:>9.1} {:>7} {:>7} {:>6.1} {:>5} {:>5}",
                        hour,
                        bucket.total_requests,
                        bucket.error_requests,
                        bucket.error_rate() * 100.0,
                        bucket.avg_response_time,
                        bucket.min_response_time,
                        bucket.max_response_time,
                        bucket.avg_security_score,
                        bucket.unique_ips,
                        bucket.unique_countries
                    );
                }
            }
        }
    }

    Ok(())
}
