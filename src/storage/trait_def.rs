use crate::analytics::{AggregationBucket, BucketKey};
use crate::models::{ExchangeRecord, NewRoute, TenantRoute};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("route identifier or tenant id already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Computes the next state of a bucket from its current state
///
/// Absent buckets are passed in as [`AggregationBucket::empty`].
pub type BucketUpdater<'a> = &'a (dyn Fn(AggregationBucket) -> AggregationBucket + Send + Sync);

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    /// Register a new route; fails with `Conflict` if the identifier or tenant id is taken
    async fn create_route(&self, route: &NewRoute) -> StorageResult<TenantRoute>;

    /// Resolve a public identifier
    async fn lookup_route(&self, identifier: &str) -> Result<Option<TenantRoute>>;

    /// All routes, optionally only those of one owner
    async fn list_routes(&self, owner: Option<&str>) -> Result<Vec<TenantRoute>>;

    /// Remove a route together with its exchange records and buckets
    async fn delete_route(&self, identifier: &str) -> Result<bool>;

    /// Append an exchange record, returning its id
    async fn insert_exchange(&self, record: &ExchangeRecord) -> Result<i64>;

    /// Exchange records of a tenant, newest first
    async fn list_exchanges(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExchangeRecord>>;

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<AggregationBucket>>;

    /// The daily bucket followed by the hourly buckets of one tenant and date
    async fn list_buckets(&self, tenant_id: &str, date: NaiveDate)
        -> Result<Vec<AggregationBucket>>;

    /// Read-modify-write every key in one transaction
    ///
    /// Either all keys are updated or none are. Returns the new buckets in
    /// the order of `keys`.
    async fn upsert_buckets(
        &self,
        keys: &[BucketKey],
        updater: BucketUpdater<'_>,
    ) -> Result<Vec<AggregationBucket>>;

    async fn upsert_bucket(
        &self,
        key: &BucketKey,
        updater: BucketUpdater<'_>,
    ) -> Result<AggregationBucket> {
        self.upsert_buckets(std::slice::from_ref(key), updater)
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("upsert returned no bucket"))
    }
}
