//! Monthly NDVI trend collectors.
//!
//! Primary: Sentinel-2 via the Copernicus Data Space statistical API
//! (OAuth2 client credentials, quota-billed per request). Fallback: the
//! free Landsat image service, same REST identify pattern as the aerial
//! collector, 30 m pixels, capped at 12 months. Both produce the same
//! series shape so the evaluators never care which archive answered.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde_json::json;

use crate::error::CollectorError;
use crate::models::parcel::{TrendDirection, TrendSource};
use crate::models::readings::{MonthlyNdvi, TrendSeries};
use crate::scoring::{index_slope, round_to};

const DEFAULT_STATS_BASE: &str = "https://sh.dataspace.copernicus.eu";
const DEFAULT_TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
const DEFAULT_LANDSAT_BASE: &str =
    "https://landsat2.arcgis.com/arcgis/rest/services/Landsat/MS/ImageServer";

const TREND_SLOPE_EPSILON: f64 = 0.005;
const FALLBACK_MAX_MONTHS: u32 = 12;

const NDVI_EVALSCRIPT: &str = r#"//VERSION=3
function setup() {
  return {
    input: [{bands: ["B04", "B08", "dataMask"]}],
    output: [
      {id: "ndvi", bands: 1, sampleType: "FLOAT32"},
      {id: "dataMask", bands: 1}
    ]
  };
}
function evaluatePixel(sample) {
  if (sample.dataMask === 0) {
    return { ndvi: [0], dataMask: [0] };
  }
  let ndvi = (sample.B08 - sample.B04) / (sample.B08 + sample.B04);
  return { ndvi: [ndvi], dataMask: [1] };
}
"#;

/// Derive the summary statistics and trend direction from a monthly series.
pub fn build_series(monthly: Vec<MonthlyNdvi>, source: TrendSource) -> TrendSeries {
    let valid: Vec<f64> = monthly.iter().filter_map(|m| m.mean).collect();
    let months_with_data = valid.len();

    let slope = index_slope(&valid);
    let direction = match slope {
        None => TrendDirection::InsufficientData,
        Some(s) if s > TREND_SLOPE_EPSILON => TrendDirection::Increasing,
        Some(s) if s < -TREND_SLOPE_EPSILON => TrendDirection::Decreasing,
        Some(_) => TrendDirection::Stable,
    };

    let mean_ndvi = if valid.is_empty() {
        None
    } else {
        Some(round_to(valid.iter().sum::<f64>() / valid.len() as f64, 4))
    };

    TrendSeries {
        latest_ndvi: valid.last().copied(),
        earliest_ndvi: valid.first().copied(),
        mean_ndvi,
        slope,
        direction,
        months_with_data,
        monthly,
        source,
    }
}

/// Calendar month starts for a lookback window ending this month.
fn month_starts(months: u32) -> Vec<NaiveDate> {
    let this_month = Utc::now()
        .date_naive()
        .with_day(1)
        .expect("first of month");
    (0..months)
        .rev()
        .filter_map(|i| this_month.checked_sub_months(Months::new(i)))
        .collect()
}

fn bbox_around(lat: f64, lng: f64, buffer_meters: f64) -> [f64; 4] {
    let lat_offset = buffer_meters / 111_000.0;
    let lng_offset = buffer_meters / (111_000.0 * lat.to_radians().cos());
    [
        lng - lng_offset,
        lat - lat_offset,
        lng + lng_offset,
        lat + lat_offset,
    ]
}

// ── Primary ──

pub struct PrimaryTrendClient {
    client: reqwest::Client,
    stats_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
    /// Requests actually issued against the quota (token calls excluded).
    requests_made: std::sync::atomic::AtomicU64,
}

impl PrimaryTrendClient {
    pub fn from_env() -> Result<Self, CollectorError> {
        let client_id = std::env::var("SH_CLIENT_ID")
            .map_err(|_| CollectorError::CredentialsMissing("SH_CLIENT_ID".into()))?;
        let client_secret = std::env::var("SH_CLIENT_SECRET")
            .map_err(|_| CollectorError::CredentialsMissing("SH_CLIENT_SECRET".into()))?;
        Ok(Self::new(
            DEFAULT_STATS_BASE,
            DEFAULT_TOKEN_URL,
            client_id,
            client_secret,
        ))
    }

    pub fn new(
        stats_base: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: super::http_client(),
            stats_base: stats_base.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
            requests_made: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn requests_made(&self) -> u64 {
        self.requests_made.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn bearer(&self) -> Result<String, CollectorError> {
        if let Some((token, expiry)) = self.token.lock().unwrap().clone() {
            if Instant::now() + Duration::from_secs(60) < expiry {
                return Ok(token);
            }
        }

        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .timeout(Duration::from_secs(super::TOKEN_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(CollectorError::AuthFailed(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollectorError::AuthFailed(e.to_string()))?;
        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| CollectorError::AuthFailed("no access_token in response".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|e| e.as_u64()).unwrap_or(3600);

        *self.token.lock().unwrap() =
            Some((token.clone(), Instant::now() + Duration::from_secs(expires_in)));
        tracing::info!("trend-primary token refreshed");
        Ok(token)
    }

    /// Monthly aggregated NDVI over the lookback window. One quota request.
    pub async fn monthly_ndvi(
        &self,
        lat: f64,
        lng: f64,
        months: u32,
    ) -> Result<TrendSeries, CollectorError> {
        let token = self.bearer().await?;
        let bbox = bbox_around(lat, lng, 50.0);
        let end = Utc::now().format("%Y-%m-%dT00:00:00Z").to_string();
        let start = (Utc::now() - chrono::Duration::days(months as i64 * 30))
            .format("%Y-%m-%dT00:00:00Z")
            .to_string();

        let payload = json!({
            "input": {
                "bounds": {
                    "bbox": bbox,
                    "properties": {"crs": "http://www.opengis.net/def/crs/EPSG/0/4326"}
                },
                "data": [{
                    "type": "sentinel-2-l2a",
                    "dataFilter": {"maxCloudCoverage": 50}
                }]
            },
            "aggregation": {
                "timeRange": {"from": start, "to": end},
                "aggregationInterval": {"of": "P1M"},
                "evalscript": NDVI_EVALSCRIPT,
                "width": 50,
                "height": 50
            }
        });

        let resp = self
            .client
            .post(format!("{}/api/v1/statistics", self.stats_base))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;
        self.requests_made
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

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

        let monthly = parse_statistics_response(&data);
        Ok(build_series(monthly, TrendSource::Primary))
    }
}

/// Pull monthly NDVI stats out of the statistics API response.
pub fn parse_statistics_response(data: &serde_json::Value) -> Vec<MonthlyNdvi> {
    let intervals = data
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();

    let mut monthly = Vec::new();
    for entry in &intervals {
        let Some(from) = entry.pointer("/interval/from").and_then(|f| f.as_str()) else {
            continue;
        };
        let month = from.chars().take(7).collect::<String>();
        let stats = entry.pointer("/outputs/ndvi/bands/B0/stats");

        let mean = stats.and_then(|s| s.get("mean")).and_then(|m| m.as_f64());
        let std = stats.and_then(|s| s.get("stDev")).and_then(|m| m.as_f64());
        let sample_count = stats
            .and_then(|s| s.get("sampleCount"))
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0);
        let nodata_count = stats
            .and_then(|s| s.get("noDataCount"))
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0);
        let cloud_pct = if sample_count > 0.0 {
            Some(round_to(nodata_count / sample_count * 100.0, 1))
        } else {
            None
        };

        monthly.push(MonthlyNdvi {
            month,
            mean: mean.map(|m| round_to(m, 4)),
            std: std.map(|s| round_to(s, 4)),
            cloud_pct,
        });
    }
    monthly
}

// ── Fallback ──

pub struct FallbackTrendClient {
    client: reqwest::Client,
    base_url: String,
}

impl FallbackTrendClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_LANDSAT_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into(),
        }
    }

    /// Monthly NDVI via one identify call per month. Free and unthrottled,
    /// but 30 m pixels; capped at 12 months to bound the call count.
    pub async fn monthly_ndvi(
        &self,
        lat: f64,
        lng: f64,
        months: u32,
    ) -> Result<TrendSeries, CollectorError> {
        let months = months.min(FALLBACK_MAX_MONTHS);
        let mut monthly = Vec::new();

        for start in month_starts(months) {
            let end = start
                .checked_add_months(Months::new(1))
                .unwrap_or(start);
            let from_ms = start
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or(0);
            let to_ms = end
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or(0);

            match self.identify_ndvi(lat, lng, from_ms, to_ms).await {
                Ok(Some(ndvi)) => monthly.push(MonthlyNdvi {
                    month: format!("{:04}-{:02}", start.year(), start.month()),
                    mean: Some(ndvi),
                    std: None,
                    cloud_pct: None,
                }),
                Ok(None) => monthly.push(MonthlyNdvi {
                    month: format!("{:04}-{:02}", start.year(), start.month()),
                    mean: None,
                    std: None,
                    cloud_pct: None,
                }),
                Err(e) => return Err(e),
            }
        }

        Ok(build_series(monthly, TrendSource::Fallback))
    }

    async fn identify_ndvi(
        &self,
        lat: f64,
        lng: f64,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Option<f64>, CollectorError> {
        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        let mosaic_rule = json!({
            "mosaicMethod": "esriMosaicAttribute",
            "sortField": "AcquisitionDate",
            "sortValue": "2099-01-01",
            "ascending": false,
        });
        let geometry_param = geometry.to_string();
        let time_param = format!("{from_ms},{to_ms}");
        let mosaic_param = mosaic_rule.to_string();
        let resp = self
            .client
            .get(format!("{}/identify", self.base_url))
            .query(&[
                ("geometry", geometry_param.as_str()),
                ("geometryType", "esriGeometryPoint"),
                ("returnGeometry", "false"),
                ("returnCatalogItems", "false"),
                ("time", time_param.as_str()),
                ("mosaicRule", mosaic_param.as_str()),
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

        Ok(parse_landsat_ndvi(
            data.get("value").and_then(|v| v.as_str()).unwrap_or(""),
        ))
    }
}

impl Default for FallbackTrendClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Landsat 8/9 multispectral band order puts Red at index 3 and NIR at
/// index 4. No data for the month is a normal gap, not an error.
pub fn parse_landsat_ndvi(value: &str) -> Option<f64> {
    if value.is_empty() || value == "NoData" {
        return None;
    }
    let bands: Vec<f64> = value
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect();
    if bands.len() < 5 {
        return None;
    }
    let (red, nir) = (bands[3], bands[4]);
    if nir + red <= 0.0 {
        return None;
    }
    Some(round_to((nir - red) / (nir + red), 4))
}
