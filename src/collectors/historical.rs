//! Aerial-historical collector: multi-year NDVI at a point.
//!
//! The live ImageServer only carries the most recent vintage per state, so
//! history comes from a STAC catalog whose items reference COGs on blob
//! storage. Each vintage costs one STAC search (cached) plus one small
//! window read; misses are cached too so a bad pixel isn't re-read every
//! run.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::{ResponseCache, DAY};
use crate::collectors::cog::{self, TransformerCache};
use crate::error::CollectorError;
use crate::models::readings::YearNdvi;

const DEFAULT_STAC_URL: &str =
    "https://planetarycomputer.microsoft.com/api/stac/v1/search";
const STAC_COLLECTION: &str = "naip";

/// Vintage years probed for history, most recent first.
pub const HISTORICAL_YEARS: &[i32] = &[2022, 2020, 2018, 2016, 2014, 2012];

const WINDOW_SIZE: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacItem {
    pub year: i32,
    pub date: String,
    pub cog_url: String,
    pub epsg: u32,
}

/// Cached per-(point, year) read, hit or miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct YearRead {
    year: i32,
    ndvi: Option<f64>,
    date: String,
    error: Option<String>,
}

pub struct HistoricalClient {
    client: reqwest::Client,
    stac_url: String,
    cache: ResponseCache,
    transformers: TransformerCache,
}

impl HistoricalClient {
    pub fn new(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::with_stac_url(DEFAULT_STAC_URL, cache_dir)
    }

    pub fn with_stac_url(
        stac_url: impl Into<String>,
        cache_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            client: super::http_client(),
            stac_url: stac_url.into(),
            cache: ResponseCache::new(cache_dir, Some(7 * DAY)),
            transformers: TransformerCache::new(),
        }
    }

    /// STAC items at a point, one per vintage year, newest first.
    pub async fn search_items(
        &self,
        lat: f64,
        lng: f64,
    ) -> Result<Vec<StacItem>, CollectorError> {
        let key = ResponseCache::key("stac_search", &json!({"lat": lat, "lng": lng}));
        if let Some(cached) = self.cache.get::<Vec<StacItem>>(&key) {
            return Ok(cached);
        }

        let payload = json!({
            "collections": [STAC_COLLECTION],
            "intersects": {"type": "Point", "coordinates": [lng, lat]},
            "limit": 20,
            "sortby": [{"field": "datetime", "direction": "desc"}],
        });

        let resp = self
            .client
            .post(&self.stac_url)
            .json(&payload)
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

        let items = parse_stac_items(&data);
        self.cache.put(&key, &items);
        tracing::info!(
            lat,
            lng,
            items = items.len(),
            years = ?items.iter().map(|i| i.year).collect::<Vec<_>>(),
            "stac search"
        );
        Ok(items)
    }

    /// NDVI per historical year at a point. Years with no item or an
    /// unreadable pixel are omitted; the misses are cached so they are not
    /// re-fetched while the cache entry lives.
    pub async fn ndvi_history(
        &self,
        lat: f64,
        lng: f64,
        years: &[i32],
    ) -> Result<Vec<YearNdvi>, CollectorError> {
        let items = self.search_items(lat, lng).await?;
        let mut results = Vec::new();

        for item in items.iter().filter(|i| years.contains(&i.year)) {
            let key = ResponseCache::key(
                "ndvi_year",
                &json!({"lat": lat, "lng": lng, "year": item.year}),
            );
            if let Some(cached) = self.cache.get::<YearRead>(&key) {
                if let Some(ndvi) = cached.ndvi {
                    results.push(YearNdvi {
                        year: cached.year,
                        ndvi,
                        date: cached.date,
                    });
                }
                continue;
            }

            match self.read_year_ndvi(lat, lng, item).await {
                Ok(ndvi) => {
                    self.cache.put(
                        &key,
                        &YearRead {
                            year: item.year,
                            ndvi: Some(ndvi),
                            date: item.date.clone(),
                            error: None,
                        },
                    );
                    results.push(YearNdvi {
                        year: item.year,
                        ndvi,
                        date: item.date.clone(),
                    });
                }
                Err(e) if e.tag() == crate::error::ErrorTag::Permanent => {
                    // Cache the miss; this pixel will not get better.
                    tracing::debug!(year = item.year, error = %e, "history year unreadable");
                    self.cache.put(
                        &key,
                        &YearRead {
                            year: item.year,
                            ndvi: None,
                            date: item.date.clone(),
                            error: Some(e.code()),
                        },
                    );
                }
                Err(e) => return Err(e),
            }
        }

        results.sort_by_key(|r| r.year);
        Ok(results)
    }

    async fn read_year_ndvi(
        &self,
        lat: f64,
        lng: f64,
        item: &StacItem,
    ) -> Result<f64, CollectorError> {
        let window = cog::read_window(
            &self.client,
            &item.cog_url,
            item.epsg,
            lat,
            lng,
            WINDOW_SIZE,
            &self.transformers,
        )
        .await?;
        cog::window_ndvi(&window)
    }
}

fn parse_stac_items(data: &serde_json::Value) -> Vec<StacItem> {
    let features = data
        .get("features")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();

    let mut items = Vec::new();
    let mut seen_years = std::collections::HashSet::new();
    for feat in &features {
        let props = feat.get("properties").cloned().unwrap_or_default();
        let year = props
            .get("naip:year")
            .and_then(|y| match y {
                serde_json::Value::String(s) => s.parse::<i32>().ok(),
                serde_json::Value::Number(n) => n.as_i64().map(|v| v as i32),
                _ => None,
            });
        let date = props
            .get("datetime")
            .and_then(|d| d.as_str())
            .map(|d| d.chars().take(10).collect::<String>());
        let epsg = props
            .get("proj:epsg")
            .and_then(|e| e.as_u64())
            .map(|e| e as u32);
        let cog_url = feat
            .pointer("/assets/image/href")
            .and_then(|h| h.as_str())
            .map(str::to_string);

        if let (Some(year), Some(date), Some(cog_url)) = (year, date, cog_url) {
            // Points on tile seams match one item per adjacent tile; keep
            // the first (most recent) per year.
            if !seen_years.insert(year) {
                continue;
            }
            items.push(StacItem {
                year,
                date,
                cog_url,
                epsg: epsg.unwrap_or(4326),
            });
        }
    }
    items
}
