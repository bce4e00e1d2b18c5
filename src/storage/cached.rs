use crate::analytics::{AggregationBucket, BucketKey};
use crate::models::{ExchangeRecord, NewRoute, TenantRoute};
use crate::storage::{BucketUpdater, Storage, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Storage wrapper that caches route lookups for the proxy hot path
///
/// Only hits are cached, so a route registered by another process becomes
/// visible on the next lookup. The TTL bounds how long a route removed by
/// another process keeps resolving here.
pub struct CachedStorage {
    /// Underlying storage implementation
    inner: Arc<dyn Storage>,
    /// Identifier -> route
    route_cache: Cache<String, TenantRoute>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn Storage>, max_cache_entries: u64, ttl_secs: u64) -> Self {
        let route_cache = Cache::builder()
            .max_capacity(max_cache_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { inner, route_cache }
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn create_route(&self, route: &NewRoute) -> StorageResult<TenantRoute> {
        let created = self.inner.create_route(route).await?;

        self.route_cache
            .insert(created.identifier.clone(), created.clone())
            .await;

        Ok(created)
    }

    async fn lookup_route(&self, identifier: &str) -> Result<Option<TenantRoute>> {
        if let Some(cached) = self.route_cache.get(identifier).await {
            return Ok(Some(cached));
        }

        let result = self.inner.lookup_route(identifier).await?;

        if let Some(route) = &result {
            self.route_cache
                .insert(identifier.to_string(), route.clone())
                .await;
        }

        Ok(result)
    }

    async fn list_routes(&self, owner: Option<&str>) -> Result<Vec<TenantRoute>> {
        self.inner.list_routes(owner).await
    }

    async fn delete_route(&self, identifier: &str) -> Result<bool> {
        let deleted = self.inner.delete_route(identifier).await?;
        self.route_cache.invalidate(identifier).await;
        Ok(deleted)
    }

    async fn insert_exchange(&self, record: &ExchangeRecord) -> Result<i64> {
        self.inner.insert_exchange(record).await
    }

    async fn list_exchanges(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExchangeRecord>> {
        self.inner.list_exchanges(tenant_id, limit, offset).await
    }

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<AggregationBucket>> {
        self.inner.get_bucket(key).await
    }

    async fn list_buckets(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AggregationBucket>> {
        self.inner.list_buckets(tenant_id, date).await
    }

    async fn upsert_buckets(
        &self,
        keys: &[BucketKey],
        updater: BucketUpdater<'_>,
    ) -> Result<Vec<AggregationBucket>> {
        self.inner.upsert_buckets(keys, updater).await
    }
}
