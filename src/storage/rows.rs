use anyhow::Result;
use sqlx::FromRow;

use crate::analytics::{AggregationBucket, BucketKey, DistinctSketch};

pub(crate) const BUCKET_COLUMNS: &str = "tenant_id, date, hour, total_requests, error_requests, \
     avg_response_time, min_response_time, max_response_time, avg_security_score, \
     critical_issues, high_issues, total_request_bytes, total_response_bytes, \
     unique_ips, unique_countries, ip_sketch, country_sketch, updated_at";

pub(crate) const EXCHANGE_COLUMNS: &str = "id, tenant_id, method, path, query, status, \
     duration_ms, request_size, response_size, client_ip, user_agent, request_headers, \
     request_body, response_headers, response_body, city, region, country_code, latitude, \
     longitude, security_score, findings, created_at";

/// Bucket as stored: date as `YYYY-MM-DD`, daily hour as -1, sketches as blobs
#[derive(Debug, FromRow)]
pub(crate) struct BucketRow {
    pub tenant_id: String,
    pub date: String,
    pub hour: i32,
    pub total_requests: i64,
    pub error_requests: i64,
    pub avg_response_time: f64,
    pub min_response_time: i64,
    pub max_response_time: i64,
    pub avg_security_score: f64,
    pub critical_issues: i64,
    pub high_issues: i64,
    pub total_request_bytes: i64,
    pub total_response_bytes: i64,
    pub unique_ips: i64,
    pub unique_countries: i64,
    pub ip_sketch: Vec<u8>,
    pub country_sketch: Vec<u8>,
    pub updated_at: i64,
}

impl TryFrom<BucketRow> for AggregationBucket {
    type Error = anyhow::Error;

    fn try_from(row: BucketRow) -> Result<Self> {
        Ok(AggregationBucket {
            key: BucketKey::from_columns(row.tenant_id, &row.date, row.hour)?,
            total_requests: row.total_requests,
            error_requests: row.error_requests,
            avg_response_time: row.avg_response_time,
            min_response_time: row.min_response_time,
            max_response_time: row.max_response_time,
            avg_security_score: row.avg_security_score,
            critical_issues: row.critical_issues,
            high_issues: row.high_issues,
            total_request_bytes: row.total_request_bytes,
            total_response_bytes: row.total_response_bytes,
            unique_ips: row.unique_ips,
            unique_countries: row.unique_countries,
            ip_sketch: DistinctSketch::from_bytes(row.ip_sketch),
            country_sketch: DistinctSketch::from_bytes(row.country_sketch),
            updated_at: row.updated_at,
        })
    }
}
