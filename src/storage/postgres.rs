use crate::analytics::{AggregationBucket, BucketKey};
use crate::models::{ExchangeRecord, NewRoute, TenantRoute};
use crate::storage::rows::{BucketRow, BUCKET_COLUMNS, EXCHANGE_COLUMNS};
use crate::storage::{BucketUpdater, Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn lock_key(key: &BucketKey) -> String {
    format!("{}|{}|{}", key.tenant_id, key.date_column(), key.hour_column())
}

async fn fetch_bucket(conn: &mut PgConnection, key: &BucketKey) -> Result<Option<AggregationBucket>> {
    let row = sqlx::query_as::<_, BucketRow>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM aggregation_buckets \
         WHERE tenant_id = $1 AND date = $2 AND hour = $3"
    ))
    .bind(&key.tenant_id)
    .bind(key.date_column())
    .bind(key.hour_column())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(AggregationBucket::try_from).transpose()
}

async fn write_bucket(conn: &mut PgConnection, bucket: &AggregationBucket) -> Result<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO aggregation_buckets ({BUCKET_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (tenant_id, date, hour) DO UPDATE SET
            total_requests = EXCLUDED.total_requests,
            error_requests = EXCLUDED.error_requests,
            avg_response_time = EXCLUDED.avg_response_time,
            min_response_time = EXCLUDED.min_response_time,
            max_response_time = EXCLUDED.max_response_time,
            avg_security_score = EXCLUDED.avg_security_score,
            critical_issues = EXCLUDED.critical_issues,
            high_issues = EXCLUDED.high_issues,
            total_request_bytes = EXCLUDED.total_request_bytes,
            total_response_bytes = EXCLUDED.total_response_bytes,
            unique_ips = EXCLUDED.unique_ips,
            unique_countries = EXCLUDED.unique_countries,
            ip_sketch = EXCLUDED.ip_sketch,
            country_sketch = EXCLUDED.country_sketch,
            updated_at = EXCLUDED.updated_at
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

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                tenant_id TEXT NOT NULL UNIQUE,
                identifier TEXT NOT NULL UNIQUE,
                origin_base_url TEXT NOT NULL,
                owner TEXT,
                created_at BIGINT NOT NULL
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
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                query TEXT,
                status INTEGER NOT NULL,
                duration_ms BIGINT NOT NULL,
                request_size BIGINT NOT NULL,
                response_size BIGINT NOT NULL,
                client_ip TEXT NOT NULL,
                user_agent TEXT,
                request_headers JSONB NOT NULL,
                request_body BYTEA NOT NULL,
                response_headers JSONB NOT NULL,
                response_body BYTEA NOT NULL,
                city TEXT,
                region TEXT,
                country_code TEXT,
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                security_score INTEGER NOT NULL,
                findings JSONB NOT NULL,
                created_at BIGINT NOT NULL
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
                total_requests BIGINT NOT NULL,
                error_requests BIGINT NOT NULL,
                avg_response_time DOUBLE PRECISION NOT NULL,
                min_response_time BIGINT NOT NULL,
                max_response_time BIGINT NOT NULL,
                avg_security_score DOUBLE PRECISION NOT NULL,
                critical_issues BIGINT NOT NULL,
                high_issues BIGINT NOT NULL,
                total_request_bytes BIGINT NOT NULL,
                total_response_bytes BIGINT NOT NULL,
                unique_ips BIGINT NOT NULL,
                unique_countries BIGINT NOT NULL,
                ip_sketch BYTEA NOT NULL,
                country_sketch BYTEA NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (tenant_id, date, hour)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn create_route(&self, route: &NewRoute) -> StorageResult<TenantRoute> {
        let created_at = chrono::Utc::now().timestamp();

        let row = sqlx::query_as::<_, TenantRoute>(
            r#"
            INSERT INTO routes (tenant_id, identifier, origin_base_url, owner, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING tenant_id, identifier, origin_base_url, owner, created_at
            "#,
        )
        .bind(&route.tenant_id)
        .bind(&route.identifier)
        .bind(&route.origin_base_url)
        .bind(&route.owner)
        .bind(created_at)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        row.ok_or(StorageError::Conflict)
    }

    async fn lookup_route(&self, identifier: &str) -> Result<Option<TenantRoute>> {
        let route = sqlx::query_as::<_, TenantRoute>(
            r#"
            SELECT tenant_id, identifier, origin_base_url, owner, created_at
            FROM routes
            WHERE identifier = $1
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
            WHERE $1::TEXT IS NULL OR owner = $1
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
            sqlx::query_scalar("DELETE FROM routes WHERE identifier = $1 RETURNING tenant_id")
                .bind(identifier)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(tenant_id) = tenant_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM exchanges WHERE tenant_id = $1")
            .bind(&tenant_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM aggregation_buckets WHERE tenant_id = $1")
            .bind(&tenant_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_exchange(&self, record: &ExchangeRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO exchanges (
                tenant_id, method, path, query, status, duration_ms, request_size,
                response_size, client_ip, user_agent, request_headers, request_body,
                response_headers, response_body, city, region, country_code, latitude,
                longitude, security_score, findings, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            RETURNING id
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
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(id)
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
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
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
             WHERE tenant_id = $1 AND date = $2 ORDER BY hour"
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
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(keys.len());

        for key in keys {
            // Serializes concurrent writers of the same bucket, including the
            // first insert where there is no row to lock yet.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(lock_key(key))
                .execute(&mut *tx)
                .await?;

            let current = fetch_bucket(&mut *tx, key)
                .await?
                .unwrap_or_else(|| AggregationBucket::empty(key.clone()));
            let next = updater(current);
            write_bucket(&mut *tx, &next).await?;
            updated.push(next);
        }

        tx.commit().await?;
        Ok(updated)
    }
}
