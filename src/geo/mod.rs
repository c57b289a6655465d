//! IP geolocation: HTTP providers with fallback behind a coalescing cache.

use serde::Serialize;
use std::time::Duration;

pub mod provider;
pub mod resolver;

pub use provider::{parse_geo_payload, GeoLookup, HttpGeoLookup};
pub use resolver::{GeoResolver, GeoStats};

/// Approximate location of an IP. Coordinates are always present together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
}

/// Result of a non-blocking cache query.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoStatus {
    Resolved(GeoLocation),
    /// A lookup is in flight (possibly just scheduled by this call).
    Pending,
    /// The last lookup failed and the cooldown has not elapsed.
    Failed,
    /// Private or local address; never looked up.
    NotApplicable,
}

impl GeoStatus {
    pub fn location(&self) -> Option<&GeoLocation> {
        match self {
            GeoStatus::Resolved(loc) => Some(loc),
            _ => None,
        }
    }
}

/// Provider and cache settings, derived from the effective config.
#[derive(Debug, Clone)]
pub struct GeoSettings {
    pub primary_url: String,
    pub fallback_urls: Vec<String>,
    pub api_key: Option<String>,
    pub api_key_header: Option<String>,
    pub timeout: Duration,
    pub negative_ttl: Duration,
    pub max_concurrent: usize,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            primary_url: "https://ipapi.co/{ip}/json/".into(),
            fallback_urls: vec!["https://ipinfo.io/{ip}/json".into()],
            api_key: None,
            api_key_header: None,
            timeout: Duration::from_millis(2500),
            negative_ttl: Duration::from_secs(300),
            max_concurrent: 4,
        }
    }
}
