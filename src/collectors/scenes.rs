//! Scene-pair collector: high-resolution archive comparison.
//!
//! Two targeted searches (a recent window for the latest scene, a 6-12
//! month older window at stricter cloud cover for the baseline), two
//! thumbnails, and a brightness-delta change score. Every search and
//! thumbnail is a billed request, so the budget is four calls per parcel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;

use crate::error::CollectorError;
use crate::models::readings::ScenePair;
use crate::scoring::round_to;
use crate::storage::{make_point_key, ObjectStore};

const DEFAULT_DATA_API: &str = "https://api.planet.com/data/v1";
const DEFAULT_TILES_API: &str = "https://tiles.planet.com/data/v1";
const ITEM_TYPE: &str = "PSScene";

/// Comparison window: at least 6 months apart, at most 12 for relevance.
const MIN_TEMPORAL_SPAN_DAYS: i64 = 180;
const MAX_TEMPORAL_SPAN_DAYS: i64 = 365;

/// Brightness delta on the 0-255 grayscale that saturates the change score.
/// A rough visual-change heuristic, not a calibrated quantity.
const CHANGE_SCORE_FULL_SCALE: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub acquired: Option<NaiveDate>,
    pub acquired_raw: Option<String>,
    pub cloud_cover: Option<f64>,
}

pub struct SceneClient {
    client: reqwest::Client,
    data_api: String,
    tiles_api: String,
    api_key: String,
    storage: Arc<dyn ObjectStore>,
    requests_made: AtomicU64,
}

impl SceneClient {
    pub fn from_env(storage: Arc<dyn ObjectStore>) -> Result<Self, CollectorError> {
        let api_key = std::env::var("PLANET_API_KEY")
            .map_err(|_| CollectorError::CredentialsMissing("PLANET_API_KEY".into()))?;
        Ok(Self::new(DEFAULT_DATA_API, DEFAULT_TILES_API, api_key, storage))
    }

    pub fn new(
        data_api: impl Into<String>,
        tiles_api: impl Into<String>,
        api_key: impl Into<String>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            client: super::http_client(),
            data_api: data_api.into(),
            tiles_api: tiles_api.into(),
            api_key: api_key.into(),
            storage,
            requests_made: AtomicU64::new(0),
        }
    }

    pub fn requests_made(&self) -> u64 {
        self.requests_made.load(Ordering::Relaxed)
    }

    async fn search(
        &self,
        lat: f64,
        lng: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cloud_cover_max: f64,
        limit: usize,
    ) -> Result<Vec<Scene>, CollectorError> {
        let body = json!({
            "item_types": [ITEM_TYPE],
            "filter": {
                "type": "AndFilter",
                "config": [
                    {
                        "type": "GeometryFilter",
                        "field_name": "geometry",
                        "config": {"type": "Point", "coordinates": [lng, lat]},
                    },
                    {
                        "type": "DateRangeFilter",
                        "field_name": "acquired",
                        "config": {
                            "gte": start.format("%Y-%m-%dT00:00:00Z").to_string(),
                            "lte": end.format("%Y-%m-%dT23:59:59Z").to_string(),
                        },
                    },
                    {
                        "type": "RangeFilter",
                        "field_name": "cloud_cover",
                        "config": {"lte": cloud_cover_max},
                    },
                ],
            },
        });

        let resp = self
            .client
            .post(format!("{}/quick-search", self.data_api))
            .header("Authorization", format!("api-key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;
        self.requests_made.fetch_add(1, Ordering::Relaxed);

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

        Ok(parse_scenes(&data, limit))
    }

    async fn thumbnail(&self, item_id: &str) -> Option<Vec<u8>> {
        let url = format!(
            "{}/item-types/{}/items/{}/thumb",
            self.tiles_api, ITEM_TYPE, item_id
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("api-key {}", self.api_key))
            .timeout(Duration::from_secs(super::THUMBNAIL_TIMEOUT_SECS))
            .send()
            .await
            .ok()?;
        self.requests_made.fetch_add(1, Ordering::Relaxed);
        if !resp.status().is_success() {
            tracing::warn!(item_id, status = %resp.status(), "thumbnail fetch failed");
            return None;
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image") {
            return None;
        }
        resp.bytes().await.ok().map(|b| b.to_vec())
    }

    /// Search for the scene pair, pull thumbnails, score the change.
    pub async fn refine(&self, lat: f64, lng: f64) -> Result<ScenePair, CollectorError> {
        let now = Utc::now();
        let recent = self
            .search(lat, lng, now - chrono::Duration::days(30), now, 0.30, 5)
            .await?;

        let mut pair = ScenePair {
            scene_count: recent.len() as i64,
            ..ScenePair::default()
        };

        let Some(latest) = recent
            .iter()
            .filter(|s| s.acquired.is_some())
            .max_by_key(|s| s.acquired)
        else {
            return Ok(pair);
        };
        let latest_date = latest.acquired.unwrap();
        pair.latest_id = Some(latest.id.clone());
        pair.latest_date = Some(latest_date.to_string());

        // Baseline search targets the 6-12 month window before the latest
        // scene, stricter cloud cover for a usable comparison.
        let latest_dt = latest_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let historical = self
            .search(
                lat,
                lng,
                latest_dt - chrono::Duration::days(MAX_TEMPORAL_SPAN_DAYS),
                latest_dt - chrono::Duration::days(MIN_TEMPORAL_SPAN_DAYS),
                0.20,
                5,
            )
            .await?;
        pair.scene_count += historical.len() as i64;

        let earliest = historical
            .iter()
            .filter_map(|s| s.acquired.map(|d| (s, d)))
            .filter(|(_, d)| {
                let span = (latest_date - *d).num_days();
                (MIN_TEMPORAL_SPAN_DAYS..=MAX_TEMPORAL_SPAN_DAYS).contains(&span)
            })
            .min_by_key(|(_, d)| *d);

        if let Some((scene, date)) = earliest {
            pair.earliest_id = Some(scene.id.clone());
            pair.earliest_date = Some(date.to_string());
            pair.temporal_span_days = Some((latest_date - date).num_days());
        } else {
            pair.earliest_date = pair.latest_date.clone();
        }

        // Thumbnails + change score.
        let mut latest_brightness = None;
        if let Some(thumb) = self.thumbnail(&latest.id).await {
            latest_brightness = mean_brightness(&thumb);
            let key = make_point_key(lat, lng, &format!("scene_latest_{latest_date}.png"));
            match self.storage.upload(&key, &thumb, "image/png").await {
                Ok(url) => pair.thumb_latest_url = Some(url),
                Err(e) => tracing::warn!("thumbnail upload failed: {e}"),
            }
        }

        if let Some((scene, date)) = earliest {
            if scene.id != latest.id {
                if let Some(thumb) = self.thumbnail(&scene.id).await {
                    let earliest_brightness = mean_brightness(&thumb);
                    let key = make_point_key(lat, lng, &format!("scene_earliest_{date}.png"));
                    match self.storage.upload(&key, &thumb, "image/png").await {
                        Ok(url) => pair.thumb_earliest_url = Some(url),
                        Err(e) => tracing::warn!("thumbnail upload failed: {e}"),
                    }
                    pair.change_score = change_score(latest_brightness, earliest_brightness);
                }
            }
        }

        tracing::info!(
            lat,
            lng,
            scenes = pair.scene_count,
            span_days = ?pair.temporal_span_days,
            change = ?pair.change_score,
            "scene pair complete"
        );
        Ok(pair)
    }
}

fn parse_scenes(data: &serde_json::Value, limit: usize) -> Vec<Scene> {
    data.get("features")
        .and_then(|f| f.as_array())
        .map(|features| {
            features
                .iter()
                .take(limit)
                .filter_map(|feat| {
                    let id = feat.get("id")?.as_str()?.to_string();
                    let acquired_raw = feat
                        .pointer("/properties/acquired")
                        .and_then(|a| a.as_str())
                        .map(str::to_string);
                    let acquired = acquired_raw
                        .as_deref()
                        .and_then(|a| a.get(..10))
                        .and_then(|a| NaiveDate::parse_from_str(a, "%Y-%m-%d").ok());
                    let cloud_cover = feat
                        .pointer("/properties/cloud_cover")
                        .and_then(|c| c.as_f64());
                    Some(Scene {
                        id,
                        acquired,
                        acquired_raw,
                        cloud_cover,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Mean grayscale brightness of a thumbnail, 0-255.
pub fn mean_brightness(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < 100 {
        return None;
    }
    let img = image::load_from_memory(bytes).ok()?;
    let gray = img.to_luma8();
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return None;
    }
    Some(pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64)
}

/// Brightness delta normalized so a 20-point swing on the 0-255 scale
/// saturates at 1.0.
pub fn change_score(latest: Option<f64>, earliest: Option<f64>) -> Option<f64> {
    let (l, e) = (latest?, earliest?);
    Some(round_to(
        ((l - e).abs() / CHANGE_SCORE_FULL_SCALE).min(1.0),
        3,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_score_normalization() {
        assert_eq!(change_score(Some(120.0), Some(110.0)), Some(0.5));
        assert_eq!(change_score(Some(110.0), Some(120.0)), Some(0.5));
        assert_eq!(change_score(Some(200.0), Some(100.0)), Some(1.0));
        assert_eq!(change_score(Some(100.0), Some(100.0)), Some(0.0));
        assert_eq!(change_score(None, Some(100.0)), None);
        assert_eq!(change_score(Some(100.0), None), None);
    }

    #[test]
    fn test_mean_brightness_rejects_garbage() {
        assert!(mean_brightness(&[0u8; 10]).is_none());
        assert!(mean_brightness(&[0u8; 500]).is_none());
    }

    #[test]
    fn test_mean_brightness_of_generated_png() {
        let img = image::GrayImage::from_pixel(8, 8, image::Luma([100u8]));
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        let brightness = mean_brightness(&bytes).unwrap();
        assert!((brightness - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_scenes() {
        let data = serde_json::json!({"features": [
            {"id": "A", "properties": {"acquired": "2026-07-01T15:30:00Z", "cloud_cover": 0.1}},
            {"id": "B", "properties": {"acquired": "2026-06-15T15:30:00Z", "cloud_cover": 0.2}},
            {"id": "no-date", "properties": {}},
        ]});
        let scenes = parse_scenes(&data, 10);
        assert_eq!(scenes.len(), 3);
        assert_eq!(scenes[0].id, "A");
        assert_eq!(
            scenes[0].acquired,
            Some(NaiveDate::from_ymd_opt(2026, 7, 1).unwrap())
        );
        assert!(scenes[2].acquired.is_none());
    }

    #[test]
    fn test_parse_scenes_respects_limit() {
        let features: Vec<_> = (0..10)
            .map(|i| serde_json::json!({"id": format!("S{i}"), "properties": {}}))
            .collect();
        let data = serde_json::json!({"features": features});
        assert_eq!(parse_scenes(&data, 3).len(), 3);
    }
}
