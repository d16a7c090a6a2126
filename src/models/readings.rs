use serde::{Deserialize, Serialize};

use crate::models::parcel::{NdviCategory, TrendDirection, TrendSource};

/// Point NDVI sample from the most-recent imagery vintage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AerialSample {
    pub ndvi: Option<f64>,
    pub date: Option<String>,
    pub category: NdviCategory,
}

/// One historical NDVI observation (one vintage year).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearNdvi {
    pub year: i32,
    pub ndvi: f64,
    pub date: String,
}

/// Flood-hazard zone lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodZone {
    pub zone: Option<String>,
    pub is_sfha: bool,
    pub risk: crate::models::parcel::FemaRisk,
    pub zone_subtype: Option<String>,
    pub map_url: Option<String>,
}

/// One month of aggregated NDVI from a satellite archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyNdvi {
    pub month: String,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub cloud_pct: Option<f64>,
}

/// Monthly trend series plus derived summary statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSeries {
    pub monthly: Vec<MonthlyNdvi>,
    pub slope: Option<f64>,
    pub direction: TrendDirection,
    pub months_with_data: usize,
    pub latest_ndvi: Option<f64>,
    pub earliest_ndvi: Option<f64>,
    pub mean_ndvi: Option<f64>,
    pub source: TrendSource,
}

impl TrendSeries {
    pub fn empty(source: TrendSource) -> Self {
        Self {
            monthly: Vec::new(),
            slope: None,
            direction: TrendDirection::InsufficientData,
            months_with_data: 0,
            latest_ndvi: None,
            earliest_ndvi: None,
            mean_ndvi: None,
            source,
        }
    }
}

/// Scene-pair comparison: latest scene vs a 6-12 month older one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenePair {
    pub scene_count: i64,
    pub latest_id: Option<String>,
    pub latest_date: Option<String>,
    pub earliest_id: Option<String>,
    pub earliest_date: Option<String>,
    pub temporal_span_days: Option<i64>,
    pub change_score: Option<f64>,
    pub thumb_latest_url: Option<String>,
    pub thumb_earliest_url: Option<String>,
}

/// Carrier-confirmed vacancy check against the address-validation API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VacancyCheck {
    pub vacant: Option<bool>,
    pub dpv_confirmed: Option<bool>,
    pub business: Option<bool>,
    pub carrier_route: Option<String>,
    pub usps_address: Option<String>,
    pub usps_city: Option<String>,
    pub usps_state: Option<String>,
    pub usps_zip: Option<String>,
    pub usps_zip4: Option<String>,
    pub address_mismatch: bool,
}

/// Geocoder resolution of a street within a county.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoResolution {
    pub city: Option<String>,
    pub zip: Option<String>,
    pub confidence: GeoConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoConfidence {
    Exact,
    Ambiguous,
    None,
}
