use crate::analytics::{AggregationBucket, BucketKey};
use crate::models::{ExchangeRecord, NewRoute, TenantRoute};
use crate::storage::rows::{BucketRow, BUCKET_COLUMNS, EXCHANGE_COLUMNS};
use crate::storage::{BucketUpdater, Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn fetch_bucket(
    conn: &mut SqliteConnection,
    key: &BucketKey,
) -> Result<Option<AggregationBucket>> {
    let row = sqlx::query_as::<_, BucketRow>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM aggregation_buckets \
         WHERE tenant_id = ? AND date = ? AND hour = ?"
    ))
    .bind(&key.tenant_id)
    .bind(key.date_column())
    .bind(key.hour_column())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(AggregationBucket::try_from).transpose()
}

async fn write_bucket(conn: &mut SqliteConnection, bucket: &AggregationBucket) -> Result<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO aggregation_buckets ({BUCKET_COLUMNS})
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tenant_id, date, hour) DO UPDATE SET
            total_requests = excluded.total_requests,
            error_requests = excluded.error_requests,
            avg_response_time = excluded.avg_response_time,
            min_response_time = excluded.min_response_time,
            max_response_time = excluded.max_response_time,
            avg_security_score = excluded.avg_security_score,
            critical_issues = excluded.critical_issues,
            high_issues = excluded.high_issues,
            total_request_bytes = excluded.total_request_bytes,
            total_response_bytes = excluded.total_response_bytes,
            unique_ips = excluded.unique_ips,
            unique_countries = excluded.unique_countries,
            ip_sketch = excluded.ip_sketch,
            country_sketch = excluded.country_sketch,
            updated_at = excluded.updated_at
        "#
    ))
    .bind(&bucket.key.tenant_id)
    .bind(bucket.key.date_column())
    .bind(bucket.key.hour_column())
    .bind(bucket.total_requests)
    .bind(bucket.error_requests)
    .bind(bucket.avg_response_time)
    .bind(bucket.min_response_time)
    .bind(bucket.max_response_time)
    .bind(bucket.avg_security_score)
    .bind(bucket.critical_issues)
    .bind(bucket.high_issues)
    .bind(bucket.total_request_bytes)
    .bind(bucket.total_response_bytes)
    .bind(bucket.unique_ips)
    .bind(bucket.unique_countries)
    .bind(bucket.ip_sketch.as_bytes())
    .bind(bucket.country_sketch.as_bytes())
    .bind(bucket.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn apply_updates(
    conn: &mut SqliteConnection,
    keys: &[BucketKey],
    updater: BucketUpdater<'_>,
) -> Result<Vec<AggregationBucket>> {
    let mut updated = Vec::with_capacity(keys.len());
    for key in keys {
        let current = fetch_bucket(conn, key)
            .await?
            .unwrap_or_else(|| AggregationBucket::empty(key.clone()));
        let next = updater(current);
        write_bucket(conn, &next).await?;
        updated.push(next);
    }
    Ok(updated)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                tenant_id TEXT NOT NULL UNIQUE,
                identifier TEXT NOT NULL UNIQUE,
                origin_base_url TEXT NOT NULL,
                owner TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_routes_owner ON routes(owner)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                query TEXT,
                status INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                request_size INTEGER NOT NULL,
                response_size INTEGER NOT NULL,
                client_ip TEXT NOT NULL,
                user_agent TEXT,
                request_headers TEXT NOT NULL,
                request_body BLOB NOT NULL,
                response_headers TEXT NOT NULL,
                response_body BLOB NOT NULL,
                city TEXT,
                region TEXT,
                country_code TEXT,
                latitude REAL,
                longitude REAL,
                security_score INTEGER NOT NULL,
                findings TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_exchanges_tenant_created ON exchanges(tenant_id, created_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aggregation_buckets (
                tenant_id TEXT NOT NULL,
                date TEXT NOT NULL,
                hour INTEGER NOT NULL,
                total_requests INTEGER NOT NULL,
                error_requests INTEGER NOT NULL,
                avg_response_time REAL NOT NULL,
                min_response_time INTEGER NOT NULL,
                max_response_time INTEGER NOT NULL,
                avg_security_score REAL NOT NULL,
                critical_issues INTEGER NOT NULL,
                high_issues INTEGER NOT NULL,
                total_request_bytes INTEGER NOT NULL,
                total_response_bytes INTEGER NOT NULL,
                unique_ips INTEGER NOT NULL,
                unique_countries INTEGER NOT NULL,
                ip_sketch BLOB NOT NULL,
                country_sketch BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(tenant_id, date, hour)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn create_route(&self, route: &NewRoute) -> StorageResult<TenantRoute> {
        let result = sqlx::query(
            r#"
            INSERT INTO routes (tenant_id, identifier, origin_base_url, owner, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&route.tenant_id)
        .bind(&route.identifier)
        .bind(&route.origin_base_url)
        .bind(&route.owner)
        .bind(now_secs())
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }

        self.lookup_route(&route.identifier)
            .await?
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("route vanished after insert")))
    }

    async fn lookup_route(&self, identifier: &str) -> Result<Option<TenantRoute>> {
        let route = sqlx::query_as::<_, TenantRoute>(
            r#"
            SELECT tenant_id, identifier, origin_base_url, owner, created_at
            FROM routes
            WHERE identifier = ?
            "#,
        )
        .bind(identifier)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(route)
    }

    async fn list_routes(&self, owner: Option<&str>) -> Result<Vec<TenantRoute>> {
        let routes = sqlx::query_as::<_, TenantRoute>(
            r#"
            SELECT tenant_id, identifier, origin_base_url, owner, created_at
            FROM routes
            WHERE ?1 IS NULL OR owner = ?1
            ORDER BY created_at DESC, identifier
            "#,
        )
        .bind(owner)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(routes)
    }

    async fn delete_route(&self, identifier: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let tenant_id: Option<String> =
            sqlx::query_scalar("SELECT tenant_id FROM routes WHERE identifier = ?")
                .bind(identifier)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(tenant_id) = tenant_id else {
            return Ok(false);
        };

        for statement in [
            "DELETE FROM exchanges WHERE tenant_id = ?",
            "DELETE FROM aggregation_buckets WHERE tenant_id = ?",
            "DELETE FROM routes WHERE tenant_id = ?",
        ] {
            sqlx::query(statement)
                .bind(&tenant_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_exchange(&self, record: &ExchangeRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO exchanges (
                tenant_id, method, path, query, status, duration_ms, request_size,
                response_size, client_ip, user_agent, request_headers, request_body,
                response_headers, response_body, city, region, country_code, latitude,
                longitude, security_score, findings, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.method)
        .bind(&record.path)
        .bind(&record.query)
        .bind(record.status)
        .bind(record.duration_ms)
        .bind(record.request_size)
        .bind(record.response_size)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(&record.request_headers)
        .bind(&record.request_body)
        .bind(&record.response_headers)
        .bind(&record.response_body)
        .bind(&record.city)
        .bind(&record.region)
        .bind(&record.country_code)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.security_score)
        .bind(&record.findings)
        .bind(record.created_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_exchanges(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExchangeRecord>> {
        let records = sqlx::query_as::<_, ExchangeRecord>(&format!(
            r#"
            SELECT {EXCHANGE_COLUMNS}
            FROM exchanges
            WHERE tenant_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(records)
    }

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<AggregationBucket>> {
        let mut conn = self.pool.acquire().await?;
        fetch_bucket(&mut *conn, key).await
    }

    async fn list_buckets(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AggregationBucket>> {
        let rows = sqlx::query_as::<_, BucketRow>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM aggregation_buckets \
             WHERE tenant_id = ? AND date = ? ORDER BY hour"
        ))
        .bind(tenant_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(AggregationBucket::try_from).collect()
    }

    async fn upsert_buckets(
        &self,
        keys: &[BucketKey],
        updater: BucketUpdater<'_>,
    ) -> Result<Vec<AggregationBucket>> {
        // IMMEDIATE takes the write lock up front so two writers can never
        // both read a bucket and then race to upgrade. The guard rolls back
        // on drop, including after a failed COMMIT.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let updated = apply_updates(&mut *tx, keys, updater).await?;
        tx.commit().await?;

        Ok(updated)
    }
}
