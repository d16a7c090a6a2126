//! Flood-hazard zone lookup against the FEMA National Flood Hazard Layer.
//!
//! Free ArcGIS MapServer, no key. Zones change rarely, so results cache for
//! 30 days.

use serde_json::json;

use crate::cache::{ResponseCache, DAY};
use crate::error::CollectorError;
use crate::models::parcel::FemaRisk;
use crate::models::readings::FloodZone;

const DEFAULT_BASE_URL: &str =
    "https://hazards.fema.gov/arcgis/rest/services/public/NFHL/MapServer";

/// Layer 28 = S_FLD_HAZ_AR (flood hazard areas).
const FLOOD_HAZARD_LAYER: u32 = 28;

const HIGH_RISK_ZONES: &[&str] = &["A", "AE", "AH", "AO", "AR", "A99", "V", "VE"];

pub struct FloodClient {
    client: reqwest::Client,
    base_url: String,
    cache: ResponseCache,
}

impl FloodClient {
    pub fn new(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, cache_dir)
    }

    pub fn with_base_url(base_url: impl Into<String>, cache_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            client: super::http_client(),
            base_url: base_url.into(),
            cache: ResponseCache::new(cache_dir, Some(30 * DAY)),
        }
    }

    /// Point-in-polygon flood zone query.
    pub async fn query(&self, lat: f64, lng: f64) -> Result<FloodZone, CollectorError> {
        let key = ResponseCache::key("flood_zone", &json!({"lat": lat, "lng": lng}));
        if let Some(cached) = self.cache.get::<FloodZone>(&key) {
            tracing::debug!(lat, lng, "flood cache hit");
            return Ok(cached);
        }

        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        let url = format!("{}/{}/query", self.base_url, FLOOD_HAZARD_LAYER);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("geometry", geometry.to_string().as_str()),
                ("geometryType", "esriGeometryPoint"),
                ("spatialRel", "esriSpatialRelIntersects"),
                ("outFields", "FLD_ZONE,SFHA_TF,ZONE_SUBTY,FLD_AR_ID,STATIC_BFE"),
                ("returnGeometry", "false"),
                ("f", "json"),
            ])
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;

        if !resp.status().is_success() {
            return Err(status_error(resp.status().as_u16(), resp.headers()));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollectorError::BadResponse(e.to_string()))?;

        let zone = parse_flood_response(&data);
        self.cache.put(&key, &zone);
        tracing::info!(lat, lng, zone = ?zone.zone, risk = zone.risk.as_str(), "flood zone");
        Ok(zone)
    }
}

pub(crate) fn status_error(status: u16, headers: &reqwest::header::HeaderMap) -> CollectorError {
    if status == 429 {
        let retry_after = headers
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        CollectorError::RateLimited { retry_after }
    } else {
        CollectorError::HttpStatus { status }
    }
}

fn parse_flood_response(data: &serde_json::Value) -> FloodZone {
    let features = data
        .get("features")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();

    let Some(attrs) = features.first().and_then(|f| f.get("attributes")) else {
        // Outside mapped flood hazard coverage entirely.
        return FloodZone {
            zone: None,
            is_sfha: false,
            risk: FemaRisk::Unknown,
            zone_subtype: None,
            map_url: None,
        };
    };

    let zone = attrs
        .get("FLD_ZONE")
        .and_then(|z| z.as_str())
        .filter(|z| !z.is_empty())
        .map(str::to_string);
    let sfha = attrs.get("SFHA_TF").and_then(|s| s.as_str()) == Some("T");
    let subtype = attrs
        .get("ZONE_SUBTY")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let risk = classify_risk(zone.as_deref(), sfha, subtype.as_deref());

    FloodZone {
        zone,
        is_sfha: sfha,
        risk,
        zone_subtype: subtype,
        map_url: None,
    }
}

/// Zone X splits on its subtype: the shaded / 0.2%-annual-chance variant is
/// moderate risk, the unshaded minimal variant is low.
pub fn classify_risk(zone: Option<&str>, sfha: bool, subtype: Option<&str>) -> FemaRisk {
    let subtype_upper = subtype.map(str::to_uppercase).unwrap_or_default();
    match zone {
        Some(z) if HIGH_RISK_ZONES.contains(&z) || sfha => FemaRisk::High,
        _ if sfha => FemaRisk::High,
        Some("X") if subtype_upper.contains("500") => FemaRisk::Moderate,
        Some("B") => FemaRisk::Moderate,
        Some("X")
            if subtype_upper.contains("SHADED") && !subtype_upper.contains("MINIMAL") =>
        {
            FemaRisk::Moderate
        }
        Some(_) => FemaRisk::Low,
        None => FemaRisk::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_high_risk_zones() {
        assert_eq!(classify_risk(Some("AE"), true, None), FemaRisk::High);
        assert_eq!(classify_risk(Some("VE"), false, None), FemaRisk::High);
        // SFHA dominates even for an otherwise-low zone label.
        assert_eq!(classify_risk(Some("X"), true, None), FemaRisk::High);
    }

    #[test]
    fn test_classify_zone_x_subtypes() {
        assert_eq!(
            classify_risk(Some("X"), false, Some("0.2 PCT ANNUAL CHANCE FLOOD HAZARD (500-year)")),
            FemaRisk::Moderate
        );
        assert_eq!(
            classify_risk(Some("X"), false, Some("AREA OF MINIMAL FLOOD HAZARD")),
            FemaRisk::Low
        );
        assert_eq!(classify_risk(Some("X"), false, None), FemaRisk::Low);
    }

    #[test]
    fn test_classify_no_coverage() {
        assert_eq!(classify_risk(None, false, None), FemaRisk::Unknown);
    }

    #[test]
    fn test_parse_empty_feature_set() {
        let zone = parse_flood_response(&json!({"features": []}));
        assert_eq!(zone.risk, FemaRisk::Unknown);
        assert!(zone.zone.is_none());
        assert!(!zone.is_sfha);
    }

    #[test]
    fn test_parse_sfha_feature() {
        let zone = parse_flood_response(&json!({
            "features": [{"attributes": {"FLD_ZONE": "AE", "SFHA_TF": "T", "ZONE_SUBTY": "FLOODWAY"}}]
        }));
        assert_eq!(zone.zone.as_deref(), Some("AE"));
        assert!(zone.is_sfha);
        assert_eq!(zone.risk, FemaRisk::High);
        assert_eq!(zone.zone_subtype.as_deref(), Some("FLOODWAY"));
    }
}
