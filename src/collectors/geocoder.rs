//! Free OSM geocoder for resolving city + ZIP from street + county.
//!
//! The address-validation API needs (city + state) or ZIP; many situs rows
//! carry neither. Usage policy is strict: 1 request/second, identifying
//! user agent, aggressive caching. Positive resolutions cache for the
//! process lifetime; negative ones expire after 10 minutes so a transient
//! outage can self-heal.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use geo::{Distance, Haversine, Point};

use crate::models::readings::{GeoConfidence, GeoResolution};

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org/search";
const MIN_INTERVAL: Duration = Duration::from_secs(1);
const NEGATIVE_TTL: Duration = Duration::from_secs(600);

pub struct GeocoderClient {
    client: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, (GeoResolution, Instant)>>,
    last_request: Mutex<Option<Instant>>,
}

impl GeocoderClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("distress-engine/0.3 (parcel enrichment)")
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            cache: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
        }
    }

    fn cache_key(street: &str, county: &str, state: &str) -> String {
        format!(
            "{}|{}|{}",
            street.trim().to_uppercase(),
            county.trim().to_uppercase(),
            state.trim().to_uppercase()
        )
    }

    fn cached(&self, key: &str) -> Option<GeoResolution> {
        let mut cache = self.cache.lock().unwrap();
        if let Some((resolution, at)) = cache.get(key) {
            if resolution.confidence == GeoConfidence::None && at.elapsed() > NEGATIVE_TTL {
                cache.remove(key);
                return None;
            }
            return Some(resolution.clone());
        }
        None
    }

    async fn pace(&self) {
        let wait = {
            let last = self.last_request.lock().unwrap();
            last.map(|at| MIN_INTERVAL.saturating_sub(at.elapsed()))
        };
        if let Some(wait) = wait {
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Resolve city and ZIP for a street within a county. Multi-candidate
    /// responses are disambiguated by haversine distance to the parcel
    /// when coordinates are known. Never errors: failures resolve to a
    /// cached negative.
    pub async fn resolve(
        &self,
        street: &str,
        county: &str,
        state: &str,
        lat: Option<f64>,
        lng: Option<f64>,
    ) -> GeoResolution {
        let key = Self::cache_key(street, county, state);
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        self.pace().await;

        let county_param = format!("{county} County");
        let result = self
            .client
            .get(&self.base_url)
            .query(&[
                ("street", street),
                ("county", county_param.as_str()),
                ("state", state),
                ("country", "US"),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", "5"),
            ])
            .send()
            .await;
        *self.last_request.lock().unwrap() = Some(Instant::now());

        let negative = GeoResolution {
            city: None,
            zip: None,
            confidence: GeoConfidence::None,
        };

        let candidates: Vec<serde_json::Value> = match result {
            Ok(resp) if resp.status().is_success() => {
                resp.json().await.unwrap_or_default()
            }
            Ok(resp) => {
                tracing::warn!(street, status = %resp.status(), "geocoder error");
                self.store(&key, negative.clone());
                return negative;
            }
            Err(e) => {
                tracing::warn!(street, error = %e, "geocoder request failed");
                self.store(&key, negative.clone());
                return negative;
            }
        };

        let resolution = pick_candidate(&candidates, lat, lng);
        tracing::debug!(
            street,
            county,
            city = ?resolution.city,
            zip = ?resolution.zip,
            candidates = candidates.len(),
            "geocoder resolved"
        );
        self.store(&key, resolution.clone());
        resolution
    }

    fn store(&self, key: &str, resolution: GeoResolution) {
        self.cache
            .lock()
            .unwrap()
            .insert(key.to_string(), (resolution, Instant::now()));
    }
}

impl Default for GeocoderClient {
    fn default() -> Self {
        Self::new()
    }
}

fn pick_candidate(
    candidates: &[serde_json::Value],
    lat: Option<f64>,
    lng: Option<f64>,
) -> GeoResolution {
    if candidates.is_empty() {
        return GeoResolution {
            city: None,
            zip: None,
            confidence: GeoConfidence::None,
        };
    }

    let best = if candidates.len() > 1 {
        match (lat, lng) {
            (Some(lat), Some(lng)) => {
                let here = Point::new(lng, lat);
                candidates
                    .iter()
                    .min_by(|a, b| {
                        let da = candidate_distance(a, here);
                        let db = candidate_distance(b, here);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap()
            }
            _ => &candidates[0],
        }
    } else {
        &candidates[0]
    };

    let addr = best.get("address").cloned().unwrap_or_default();
    let city = ["city", "town", "village", "hamlet"]
        .iter()
        .find_map(|k| addr.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string);
    let zip = addr
        .get("postcode")
        .and_then(|p| p.as_str())
        .map(|p| p.chars().take(5).collect::<String>());

    let confidence = if city.is_none() && zip.is_none() {
        GeoConfidence::None
    } else if candidates.len() == 1 {
        GeoConfidence::Exact
    } else {
        GeoConfidence::Ambiguous
    };

    GeoResolution {
        city,
        zip,
        confidence,
    }
}

fn candidate_distance(candidate: &serde_json::Value, here: Point<f64>) -> f64 {
    let lat = candidate
        .get("lat")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let lon = candidate
        .get("lon")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    Haversine.distance(here, Point::new(lon, lat))
}
