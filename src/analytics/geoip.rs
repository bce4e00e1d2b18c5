//! Local geolocation using a MaxMind GeoLite2/GeoIP2 City MMDB
//!
//! The database is memory-mapped once and shared; lookups are synchronous
//! and cheap, so they run inline on the pipeline worker.

use anyhow::{Context, Result};
use async_trait::async_trait;
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

use crate::analytics::geo::{GeoError, GeoLookup};
use crate::analytics::models::GeoLocation;

#[derive(Clone)]
pub struct MaxMindLookup {
    city_reader: Arc<Reader<Mmap>>,
}

impl MaxMindLookup {
    /// Open a City (or Country) database at `city_path`
    pub fn new(city_path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(city_path) }
            .with_context(|| format!("Failed to open GeoIP City database at {}", city_path))?;

        Ok(Self {
            city_reader: Arc::new(reader),
        })
    }

    fn lookup_sync(&self, ip: IpAddr) -> Option<GeoLocation> {
        let result = self.city_reader.lookup(ip).ok()?;

        if let Ok(Some(city)) = result.decode::<geoip2::City>() {
            return Some(GeoLocation {
                city: city.city.names.english.map(|s| s.to_string()),
                region: city
                    .subdivisions
                    .first()
                    .and_then(|s| s.names.english)
                    .map(|s| s.to_string()),
                country_code: city.country.iso_code.map(|s| s.to_string()),
                latitude: city.location.latitude,
                longitude: city.location.longitude,
            });
        }

        // A City database is a superset of Country data, so a Country decode
        // still yields the country when the city record is missing.
        if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
            return Some(GeoLocation {
                country_code: country.country.iso_code.map(|s| s.to_string()),
                ..Default::default()
            });
        }

        None
    }
}

#[async_trait]
impl GeoLookup for MaxMindLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        self.lookup_sync(ip).ok_or(GeoError::NotFound(ip))
    }
}
