//! Aerial-current collector: point NDVI from the most-recent imagery
//! vintage via an ArcGIS ImageServer identify call.
//!
//! Bands arrive as a comma-separated value string (Red, Green, Blue, NIR);
//! acquisition dates come from the catalog items riding along the response.

use chrono::DateTime;
use serde_json::json;

use crate::cache::{ResponseCache, DAY};
use crate::error::CollectorError;
use crate::models::parcel::NdviCategory;
use crate::models::readings::AerialSample;
use crate::scoring::round_to;

const DEFAULT_BASE_URL: &str =
    "https://imagery.nationalmap.gov/arcgis/rest/services/USGSNAIPPlus/ImageServer";

pub struct AerialClient {
    client: reqwest::Client,
    base_url: String,
    cache: ResponseCache,
}

impl AerialClient {
    pub fn new(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, cache_dir)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        cache_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into(),
            cache: ResponseCache::new(cache_dir, Some(7 * DAY)),
        }
    }

    async fn identify(&self, lat: f64, lng: f64) -> Result<serde_json::Value, CollectorError> {
        let key = ResponseCache::key("identify", &json!({"lat": lat, "lng": lng}));
        if let Some(cached) = self.cache.get::<serde_json::Value>(&key) {
            tracing::debug!(lat, lng, "identify cache hit");
            return Ok(cached);
        }

        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        let url = format!("{}/identify", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("geometry", geometry.to_string().as_str()),
                ("geometryType", "esriGeometryPoint"),
                ("returnCatalogItems", "true"),
                ("returnGeometry", "false"),
                ("f", "json"),
            ])
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;

        if !resp.status().is_success() {
            return Err(super::flood::status_error(
                resp.status().as_u16(),
                resp.headers(),
            ));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollectorError::BadResponse(e.to_string()))?;
        self.cache.put(&key, &data);
        Ok(data)
    }

    /// Single-call NDVI lookup for batch scanning: no history, no export.
    pub async fn current(&self, lat: f64, lng: f64) -> Result<AerialSample, CollectorError> {
        let data = self.identify(lat, lng).await?;

        let value = data.get("value").and_then(|v| v.as_str()).unwrap_or("");
        let ndvi = match parse_band_ndvi(value) {
            Ok(ndvi) => ndvi,
            Err(CollectorError::NoCoverage) => {
                // No imagery here: a permanent condition, surfaced as a
                // no-data sample rather than a retry loop.
                return Ok(AerialSample {
                    ndvi: None,
                    date: extract_acquisition_date(&data),
                    category: NdviCategory::NoData,
                });
            }
            Err(e) => return Err(e),
        };

        let sample = AerialSample {
            ndvi: Some(ndvi),
            date: extract_acquisition_date(&data),
            category: NdviCategory::from_ndvi(Some(ndvi)),
        };
        tracing::info!(lat, lng, ndvi, category = sample.category.as_str(), "ndvi computed");
        Ok(sample)
    }
}

/// Parse the identify value string and compute point NDVI.
///
/// Band order: Red, Green, Blue, NIR. Three bands means the NIR band is
/// missing at this location; anything else unexpected is a parse failure.
pub fn parse_band_ndvi(value: &str) -> Result<f64, CollectorError> {
    if value.is_empty() || value == "NoData" || value == "Pixel value is NoData" {
        return Err(CollectorError::NoCoverage);
    }

    let bands: Vec<f64> = value
        .replace(',', " ")
        .split_whitespace()
        .map(|p| p.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| CollectorError::BandParse(e.to_string()))?;

    if bands.len() < 4 {
        return Err(CollectorError::InsufficientBands(bands.len()));
    }

    let (red, nir) = (bands[0], bands[3]);
    let denom = nir + red;
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok(round_to((nir - red) / denom, 4))
}

/// Acquisition date from catalog items: primary-resolution tiles
/// (Category 1) carry an epoch-ms `acquisition_date`; fall back to any
/// feature's Year field.
pub fn extract_acquisition_date(data: &serde_json::Value) -> Option<String> {
    let features = data
        .get("catalogItems")
        .and_then(|c| c.get("features"))
        .and_then(|f| f.as_array())?;

    for feat in features {
        let Some(attrs) = feat.get("attributes") else {
            continue;
        };
        if attrs.get("Category").and_then(|c| c.as_i64()) != Some(1) {
            continue;
        }
        if let Some(ms) = attrs.get("acquisition_date").and_then(|d| d.as_f64()) {
            if ms > 1e10 {
                if let Some(dt) = DateTime::from_timestamp_millis(ms as i64) {
                    return Some(dt.format("%Y-%m-%d").to_string());
                }
            }
        }
    }
    for feat in features {
        if let Some(year) = feat
            .get("attributes")
            .and_then(|a| a.get("Year"))
            .and_then(|y| y.as_i64())
        {
            return Some(format!("{year}-01-01"));
        }
    }
    None
}
