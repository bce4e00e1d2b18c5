//! Data models for analytics

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::analytics::sketch::DistinctSketch;
use crate::models::Exchange;
use crate::security::{SecurityReport, Severity};

/// Coarse geographic location derived from a caller IP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: Option<String>,

    /// Region/state/province
    pub region: Option<String>,

    /// ISO country code (e.g., "US", "GB")
    pub country_code: Option<String>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Everything the aggregator needs to know about one exchange
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub status: u16,
    pub security_score: i32,
    pub critical_findings: i64,
    pub high_findings: i64,
    pub client_ip: IpAddr,
    /// Absent when geo resolution was skipped or failed
    pub country_code: Option<String>,
}

impl ExchangeSummary {
    pub fn new(exchange: &Exchange, report: &SecurityReport, geo: Option<&GeoLocation>) -> Self {
        Self {
            tenant_id: exchange.tenant_id.clone(),
            timestamp: exchange.timestamp,
            duration_ms: exchange.duration_ms,
            request_bytes: exchange.request.body.len() as i64,
            response_bytes: exchange.response.body.len() as i64,
            status: exchange.response.status.as_u16(),
            security_score: report.score,
            critical_findings: report.count(Severity::Critical) as i64,
            high_findings: report.count(Severity::High) as i64,
            client_ip: exchange.client_ip,
            country_code: geo.and_then(|g| g.country_code.clone()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Identifies one aggregation bucket. `hour == None` is the daily bucket.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketKey {
    pub tenant_id: String,
    pub date: NaiveDate,
    pub hour: Option<u8>,
}

/// Column value used for the daily bucket's hour
pub const DAILY_HOUR: i32 = -1;

impl BucketKey {
    pub fn hourly(tenant_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            date: timestamp.date_naive(),
            hour: Some(timestamp.hour() as u8),
        }
    }

    pub fn daily(tenant_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            date: timestamp.date_naive(),
            hour: None,
        }
    }

    /// The hourly and daily buckets an exchange at `timestamp` belongs to
    pub fn for_timestamp(tenant_id: &str, timestamp: DateTime<Utc>) -> [BucketKey; 2] {
        [
            Self::hourly(tenant_id, timestamp),
            Self::daily(tenant_id, timestamp),
        ]
    }

    pub fn date_column(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    pub fn hour_column(&self) -> i32 {
        self.hour.map(i32::from).unwrap_or(DAILY_HOUR)
    }

    pub fn from_columns(tenant_id: String, date: &str, hour: i32) -> anyhow::Result<Self> {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;
        let hour = match hour {
            DAILY_HOUR => None,
            0..=23 => Some(hour as u8),
            other => anyhow::bail!("bucket hour {other} out of range"),
        };
        Ok(Self {
            tenant_id,
            date,
            hour,
        })
    }
}

/// Running statistics for one tenant over one hour or one day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationBucket {
    #[serde(flatten)]
    pub key: BucketKey,
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
    /// Approximate distinct caller IPs
    pub unique_ips: i64,
    /// Approximate distinct caller countries; unresolved callers are excluded
    pub unique_countries: i64,
    #[serde(skip)]
    pub ip_sketch: DistinctSketch,
    #[serde(skip)]
    pub country_sketch: DistinctSketch,
    pub updated_at: i64,
}

impl AggregationBucket {
    /// Zero-value bucket handed to updaters when the key does not exist yet
    pub fn empty(key: BucketKey) -> Self {
        Self {
            key,
            total_requests: 0,
            error_requests: 0,
            avg_response_time: 0.0,
            min_response_time: 0,
            max_response_time: 0,
            avg_security_score: 0.0,
            critical_issues: 0,
            high_issues: 0,
            total_request_bytes: 0,
            total_response_bytes: 0,
            unique_ips: 0,
            unique_countries: 0,
            ip_sketch: DistinctSketch::new(),
            country_sketch: DistinctSketch::new(),
            updated_at: 0,
        }
    }

    /// Fold one exchange into the bucket
    ///
    /// Means are updated as `(old_mean * old_count + value) / (old_count + 1)`;
    /// a fresh bucket is seeded from the single observation.
    pub fn record(mut self, summary: &ExchangeSummary) -> Self {
        let old_count = self.total_requests;
        let new_count = old_count + 1;
        let duration = summary.duration_ms;

        if old_count == 0 {
            self.avg_response_time = duration as f64;
            self.min_response_time = duration;
            self.max_response_time = duration;
            self.avg_security_score = f64::from(summary.security_score);
        } else {
            self.avg_response_time = running_mean(self.avg_response_time, old_count, duration as f64);
            self.min_response_time = self.min_response_time.min(duration);
            self.max_response_time = self.max_response_time.max(duration);
            self.avg_security_score = running_mean(
                self.avg_security_score,
                old_count,
                f64::from(summary.security_score),
            );
        }

        self.total_requests = new_count;
        if summary.is_error() {
            self.error_requests += 1;
        }
        self.critical_issues += summary.critical_findings;
        self.high_issues += summary.high_findings;
        self.total_request_bytes += summary.request_bytes;
        self.total_response_bytes += summary.response_bytes;

        self.ip_sketch.insert(summary.client_ip.to_string().as_bytes());
        if let Some(country) = &summary.country_code {
            self.country_sketch.insert(country.as_bytes());
        }
        self.unique_ips = self.ip_sketch.estimate() as i64;
        self.unique_countries = self.country_sketch.estimate() as i64;
        self.updated_at = summary.timestamp.timestamp_millis();

        self
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.error_requests as f64 / self.total_requests as f64
        }
    }
}

fn running_mean(old_mean: f64, old_count: i64, value: f64) -> f64 {
    (old_mean * old_count as f64 + value) / (old_count + 1) as f64
}
