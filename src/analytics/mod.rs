//! Exchange analytics: geolocation, cardinality sketches and bucket
//! aggregation.
//!
//! Everything here runs on the cold path, behind the telemetry pipeline.

pub mod aggregator;
pub mod geo;
pub mod geoip;
pub mod models;
pub mod sketch;

pub use aggregator::{AggregatorError, AnalyticsAggregator};
pub use geo::{is_non_routable, GeoError, GeoLookup, GeoResolver, IpApiLookup};
pub use geoip::MaxMindLookup;
pub use models::{AggregationBucket, BucketKey, ExchangeSummary, GeoLocation};
pub use sketch::DistinctSketch;
