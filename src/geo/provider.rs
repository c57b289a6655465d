//! Geolocation HTTP providers.

use serde_json::Value;
use std::future::Future;
use std::net::IpAddr;
use tracing::{debug, warn};

use super::{GeoLocation, GeoSettings};
use crate::error::GeoError;

/// A source of IP locations.
pub trait GeoLookup: Send + Sync + 'static {
    fn lookup(&self, ip: IpAddr) -> impl Future<Output = Result<GeoLocation, GeoError>> + Send;
}

/// Queries each URL template in order until one returns a usable location.
pub struct HttpGeoLookup {
    http: reqwest::Client,
    templates: Vec<String>,
    api_key: Option<String>,
    api_key_header: Option<String>,
}

impl HttpGeoLookup {
    pub fn new(settings: &GeoSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("hostpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building geolocation HTTP client")?;

        let mut templates = vec![settings.primary_url.clone()];
        templates.extend(settings.fallback_urls.iter().cloned());

        Ok(Self {
            http,
            templates,
            api_key: settings.api_key.clone(),
            api_key_header: settings.api_key_header.clone(),
        })
    }

    async fn fetch(&self, template: &str, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = render_url(template, ip, self.api_key.as_deref())?;

        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let (Some(header), Some(key)) = (&self.api_key_header, &self.api_key) {
            request = request.header(header.as_str(), key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeoError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GeoError::Malformed(e.to_string()))?;
        parse_geo_payload(&body)
    }
}

impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        for (idx, template) in self.templates.iter().enumerate() {
            match self.fetch(template, ip).await {
                Ok(location) => {
                    debug!("Resolved {} via provider {}", ip, idx);
                    return Ok(location);
                }
                Err(e) => warn!("Geolocation provider {} failed for {}: {}", idx, ip, e),
            }
        }
        Err(GeoError::AllProvidersFailed {
            attempts: self.templates.len(),
        })
    }
}

/// Substitutes `{ip}` and `{api_key}` into a URL template.
pub fn render_url(template: &str, ip: IpAddr, api_key: Option<&str>) -> Result<String, GeoError> {
    if !template.contains("{ip}") {
        return Err(GeoError::Template(template.to_string()));
    }
    Ok(template
        .replace("{ip}", &ip.to_string())
        .replace("{api_key}", api_key.unwrap_or("")))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_number(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| body.get(*k).and_then(number))
}

fn first_string(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        body.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Extracts a location from the common provider payload shapes
/// (ipapi.co, ipinfo.io, ip-api.com).
pub fn parse_geo_payload(body: &Value) -> Result<GeoLocation, GeoError> {
    if body.get("error").and_then(Value::as_bool) == Some(true) {
        let reason = first_string(body, &["reason", "message"]).unwrap_or_default();
        return Err(GeoError::Malformed(format!("provider error: {reason}")));
    }
    if body.get("status").and_then(Value::as_str) == Some("fail") {
        return Err(GeoError::Malformed("provider status fail".into()));
    }

    let mut lat = first_number(body, &["latitude", "lat"]);
    let mut lon = first_number(body, &["longitude", "lon"]);
    if lat.is_none() || lon.is_none() {
        if let Some((a, b)) = body
            .get("loc")
            .and_then(Value::as_str)
            .and_then(|loc| loc.split_once(','))
        {
            lat = a.trim().parse().ok();
            lon = b.trim().parse().ok();
        }
    }

    let (Some(lat), Some(lon)) = (lat, lon) else {
        return Err(GeoError::Malformed("missing coordinates".into()));
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(GeoError::Malformed(format!("coordinates out of range: {lat},{lon}")));
    }

    Ok(GeoLocation {
        lat,
        lon,
        country: first_string(body, &["country_name", "country", "countryCode"]),
        country_code: first_string(body, &["country_code", "countryCode", "country"]),
        city: first_string(body, &["city"]),
    })
}
