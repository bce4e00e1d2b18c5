//! Concurrency tests for bucket aggregation
//!
//! Most tests hammer the same bucket keys from many tasks at once and then
//! check that no update was lost and that running means are exact.

use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vantage::analytics::aggregator::apply_summary;
use vantage::analytics::{AggregationBucket, AnalyticsAggregator, BucketKey, ExchangeSummary};
use vantage::storage::{SqliteStorage, Storage};

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

/// On-disk database shared by several pooled connections, removed on drop
struct FileDb {
    path: PathBuf,
}

impl FileDb {
    fn new(name: &str) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = std::env::temp_dir().join(format!(
            "vantage-{name}-{}-{nanos}.db",
            std::process::id()
        ));
        Self { path }
    }

    fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }

    async fn storage(&self, max_connections: u32) -> Arc<dyn Storage> {
        let storage = SqliteStorage::new(&self.url(), max_connections).await.unwrap();
        storage.init().await.unwrap();
        Arc::new(storage)
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

fn summary(tenant: &str, timestamp: DateTime<Utc>, duration_ms: i64, ip: IpAddr) -> ExchangeSummary {
    ExchangeSummary {
        tenant_id: tenant.to_string(),
        timestamp,
        duration_ms,
        request_bytes: 100,
        response_bytes: 1000,
        status: if duration_ms % 10 == 0 { 500 } else { 200 },
        security_score: 80,
        critical_findings: 0,
        high_findings: 1,
        client_ip: ip,
        country_code: Some("FR".to_string()),
    }
}

fn ip(i: u32) -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::from(0xCB00_7100 + (i % 200)))
}

#[tokio::test]
async fn test_concurrent_updates_same_bucket_are_not_lost() {
    let storage = create_test_storage().await;
    let aggregator = Arc::new(AnalyticsAggregator::new(Arc::clone(&storage), 8, 32));
    let ts = Utc.with_ymd_and_hms(2025, 5, 20, 14, 10, 0).unwrap();

    let n: i64 = 200;
    let mut handles = vec![];
    for i in 1..=n {
        let aggregator = Arc::clone(&aggregator);
        handles.push(tokio::spawn(async move {
            aggregator
                .record(summary("busy", ts, i, ip(i as u32)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    aggregator.flush().await;

    for key in BucketKey::for_timestamp("busy", ts) {
        let bucket = storage.get_bucket(&key).await.unwrap().unwrap();
        assert_eq!(bucket.total_requests, n);
        assert_eq!(bucket.error_requests, n / 10);
        assert!((bucket.avg_response_time - 100.5).abs() < 1e-6);
        assert_eq!(bucket.min_response_time, 1);
        assert_eq!(bucket.max_response_time, n);
        assert!((bucket.avg_security_score - 80.0).abs() < 1e-9);
        assert_eq!(bucket.high_issues, n);
        assert_eq!(bucket.total_request_bytes, 100 * n);
        assert_eq!(bucket.total_response_bytes, 1000 * n);
        assert_eq!(bucket.unique_countries, 1);
        // 200 distinct caller IPs, HyperLogLog estimate within 10%
        assert!((180..=220).contains(&bucket.unique_ips), "unique_ips = {}", bucket.unique_ips);
    }
}

#[tokio::test]
async fn test_concurrent_store_upserts_without_actors() {
    let storage = create_test_storage().await;
    let ts = Utc.with_ymd_and_hms(2025, 5, 21, 9, 0, 0).unwrap();

    let mut handles = vec![];
    for i in 1..=50 {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            apply_summary(storage.as_ref(), &summary("direct", ts, i, ip(1)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let hourly = storage
        .get_bucket(&BucketKey::hourly("direct", ts))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hourly.total_requests, 50);
    assert!((hourly.avg_response_time - 25.5).abs() < 1e-6);
    assert_eq!(hourly.unique_ips, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_on_file_database_are_linearized() {
    let db = FileDb::new("linearized");
    let storage = db.storage(8).await;
    let ts = Utc.with_ymd_and_hms(2025, 5, 22, 16, 45, 0).unwrap();

    let n: i64 = 200;
    let mut handles = vec![];
    for i in 1..=n {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            apply_summary(storage.as_ref(), &summary("filedb", ts, i, ip(i as u32))).await
        }));
    }

    let mut failures = 0;
    for handle in handles {
        if let Err(err) = handle.await.unwrap() {
            eprintln!("upsert failed: {err:#}");
            failures += 1;
        }
    }
    assert_eq!(failures, 0);

    for key in BucketKey::for_timestamp("filedb", ts) {
        let bucket = storage.get_bucket(&key).await.unwrap().unwrap();
        assert_eq!(bucket.total_requests, n);
        assert!((bucket.avg_response_time - 100.5).abs() < 1e-6);
        assert_eq!(bucket.min_response_time, 1);
        assert_eq!(bucket.max_response_time, n);
        assert_eq!(bucket.error_requests, n / 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_upsert_rolls_back_and_releases_write_lock() {
    let db = FileDb::new("rollback");
    let storage = db.storage(4).await;
    let ts = Utc.with_ymd_and_hms(2025, 5, 23, 8, 0, 0).unwrap();
    let [hourly, daily] = BucketKey::for_timestamp("broken", ts);

    // A daily row whose hour column cannot be decoded makes the second key fail
    let raw = sqlx::SqlitePool::connect(&db.url()).await.unwrap();
    sqlx::query(
        "INSERT INTO aggregation_buckets (tenant_id, date, hour, total_requests, error_requests, \
         avg_response_time, min_response_time, max_response_time, avg_security_score, \
         critical_issues, high_issues, total_request_bytes, total_response_bytes, unique_ips, \
         unique_countries, ip_sketch, country_sketch, updated_at) \
         VALUES (?, ?, 99, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, x'', x'', 0)",
    )
    .bind("broken")
    .bind(daily.date_column())
    .execute(&raw)
    .await
    .unwrap();
    raw.close().await;

    let mut corrupt = daily.clone();
    corrupt.hour = Some(99);
    let summary = summary("broken", ts, 10, ip(1));
    let result = storage
        .upsert_buckets(&[hourly.clone(), corrupt], &|b: AggregationBucket| b.record(&summary))
        .await;
    assert!(result.is_err());

    // The hourly write from the failed transaction was discarded
    assert!(storage.get_bucket(&hourly).await.unwrap().is_none());

    // Other writers are not blocked by a leftover transaction
    let applied = tokio::time::timeout(
        Duration::from_secs(2),
        apply_summary(storage.as_ref(), &summary),
    )
    .await
    .expect("write lock should have been released")
    .unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].total_requests, 1);
    assert_eq!(applied[1].total_requests, 1);
}

#[tokio::test]
async fn test_daily_bucket_equals_sum_of_hourly() {
    let storage = create_test_storage().await;
    let aggregator = Arc::new(AnalyticsAggregator::new(Arc::clone(&storage), 4, 16));
    let day = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();

    let mut handles = vec![];
    for i in 0..120u32 {
        let aggregator = Arc::clone(&aggregator);
        // Spread over hours 0, 7, 13 and 23
        let hour = [0, 7, 13, 23][(i % 4) as usize];
        let ts = day + chrono::Duration::hours(hour) + chrono::Duration::seconds(i as i64);
        handles.push(tokio::spawn(async move {
            aggregator
                .record(summary("daily", ts, i as i64 + 1, ip(i)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    aggregator.flush().await;

    let buckets = storage.list_buckets("daily", day.date_naive()).await.unwrap();
    let (daily, hourly): (Vec<_>, Vec<_>) = buckets.into_iter().partition(|b| b.key.hour.is_none());
    assert_eq!(daily.len(), 1);
    assert_eq!(hourly.len(), 4);
    let daily = &daily[0];

    assert_eq!(daily.total_requests, hourly.iter().map(|b| b.total_requests).sum::<i64>());
    assert_eq!(daily.error_requests, hourly.iter().map(|b| b.error_requests).sum::<i64>());
    assert_eq!(
        daily.total_response_bytes,
        hourly.iter().map(|b| b.total_response_bytes).sum::<i64>()
    );
    assert_eq!(daily.min_response_time, hourly.iter().map(|b| b.min_response_time).min().unwrap());
    assert_eq!(daily.max_response_time, hourly.iter().map(|b| b.max_response_time).max().unwrap());

    // Weighted hourly means reproduce the daily mean
    let weighted: f64 = hourly
        .iter()
        .map(|b| b.avg_response_time * b.total_requests as f64)
        .sum::<f64>()
        / daily.total_requests as f64;
    assert!((weighted - daily.avg_response_time).abs() < 1e-6);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let storage = create_test_storage().await;
    let aggregator = Arc::new(AnalyticsAggregator::new(Arc::clone(&storage), 8, 16));
    let ts = Utc.with_ymd_and_hms(2025, 7, 4, 18, 0, 0).unwrap();

    let mut handles = vec![];
    for i in 0..60u32 {
        let aggregator = Arc::clone(&aggregator);
        let tenant = if i % 3 == 0 { "alpha" } else { "beta" };
        handles.push(tokio::spawn(async move {
            aggregator
                .record(summary(tenant, ts, 5, ip(i)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    aggregator.flush().await;

    let alpha = storage.get_bucket(&BucketKey::daily("alpha", ts)).await.unwrap().unwrap();
    let beta = storage.get_bucket(&BucketKey::daily("beta", ts)).await.unwrap().unwrap();
    assert_eq!(alpha.total_requests, 20);
    assert_eq!(beta.total_requests, 40);
    assert!(storage
        .get_bucket(&BucketKey::daily("gamma", ts))
        .await
        .unwrap()
        .is_none());
}
