use serde::{Deserialize, Serialize};

/// Vegetation density category derived from point NDVI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NdviCategory {
    Bare,
    Minimal,
    Sparse,
    Moderate,
    Dense,
    NoData,
    Error,
}

impl NdviCategory {
    /// Categorize a point NDVI per the distress-detection bands.
    pub fn from_ndvi(ndvi: Option<f64>) -> Self {
        match ndvi {
            None => NdviCategory::NoData,
            Some(v) if v < 0.10 => NdviCategory::Bare,
            Some(v) if v < 0.30 => NdviCategory::Minimal,
            Some(v) if v < 0.50 => NdviCategory::Sparse,
            Some(v) if v < 0.65 => NdviCategory::Moderate,
            Some(_) => NdviCategory::Dense,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NdviCategory::Bare => "bare",
            NdviCategory::Minimal => "minimal",
            NdviCategory::Sparse => "sparse",
            NdviCategory::Moderate => "moderate",
            NdviCategory::Dense => "dense",
            NdviCategory::NoData => "no_data",
            NdviCategory::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FemaRisk {
    High,
    Moderate,
    Low,
    Unknown,
}

impl FemaRisk {
    pub fn as_str(self) -> &'static str {
        match self {
            FemaRisk::High => "high",
            FemaRisk::Moderate => "moderate",
            FemaRisk::Low => "low",
            FemaRisk::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => FemaRisk::High,
            "moderate" => FemaRisk::Moderate,
            "low" => FemaRisk::Low,
            _ => FemaRisk::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

impl TrendDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
            TrendDirection::InsufficientData => "insufficient_data",
        }
    }
}

/// Which archive produced the monthly trend series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendSource {
    Primary,
    Fallback,
}

impl TrendSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendSource::Primary => "primary",
            TrendSource::Fallback => "fallback",
        }
    }
}

// ── Per-pass selection rows ──
// Each selector returns only the columns its pass needs, mirroring the
// eligibility predicate that produced it.

/// Parcel eligible for pass 1 (coordinates present, never scanned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnscannedParcel {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Parcel with pass-1 NDVI but no historical slope yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlopeParcel {
    pub parcel_id: String,
    pub county: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ndvi_current: Option<f64>,
    pub ndvi_date: Option<String>,
}

/// Parcel flagged for trend enrichment (sentinel_worthy, not yet enriched).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendParcel {
    pub parcel_id: String,
    pub county: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ndvi_current: Option<f64>,
    pub fema_zone: Option<String>,
    pub fema_risk: Option<String>,
    pub fema_sfha: bool,
    pub distress_score: Option<f64>,
}

/// Parcel eligible for a scene-pair comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneParcel {
    pub parcel_id: String,
    pub county: String,
    pub latitude: f64,
    pub longitude: f64,
    pub planet_scan_date: Option<String>,
}

/// Top lead eligible for a carrier vacancy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VacancyParcel {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub situs_address: Option<String>,
    pub distress_composite: Option<f64>,
    pub mailing_city: Option<String>,
    pub mailing_state: Option<String>,
    pub mailing_zip: Option<String>,
}

/// Conviction inputs: distress composite, vacancy state, and motivation
/// signal aggregates joined at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvictionParcel {
    pub parcel_id: String,
    pub distress_composite: Option<f64>,
    pub flag_vacancy: bool,
    pub vacancy_confidence: Option<f64>,
    pub usps_error: Option<String>,
    pub mc_raw: f64,
    pub mc_count: i64,
    pub mc_codes: Option<String>,
}

// ── Per-pass result rows ──
// One struct per pass-owned column set; these are what flushes write and
// what the outage journal serializes.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub parcel_id: String,
    pub county: String,
    pub ndvi_current: Option<f64>,
    pub ndvi_date: Option<String>,
    pub ndvi_category: NdviCategory,
    pub fema_zone: Option<String>,
    pub fema_risk: Option<String>,
    pub fema_sfha: bool,
    pub distress_score: Option<f64>,
    pub distress_flags: Option<String>,
    pub flag_veg_overgrowth: bool,
    pub flag_veg_neglect: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
    pub scan_date: String,
    pub scan_pass: f64,
    pub sentinel_worthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlopeResult {
    pub parcel_id: String,
    pub county: String,
    pub ndvi_slope_per_year: Option<f64>,
    pub ndvi_history_count: i64,
    pub ndvi_history_years: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    pub parcel_id: String,
    pub county: String,
    pub sentinel_trend_direction: TrendDirection,
    pub sentinel_trend_slope: Option<f64>,
    pub sentinel_latest_ndvi: Option<f64>,
    pub sentinel_months_data: i64,
    pub sentinel_mean_ndvi: Option<f64>,
    pub sentinel_data_source: Option<TrendSource>,
    pub sentinel_chart_url: Option<String>,
    pub sentinel_scan_date: String,
    // Re-scored flags with the trend series folded in.
    pub distress_score: Option<f64>,
    pub distress_flags: Option<String>,
    pub flag_veg_overgrowth: bool,
    pub flag_veg_neglect: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
    pub scan_pass: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneResult {
    pub parcel_id: String,
    pub county: String,
    pub planet_scene_count: i64,
    pub planet_change_score: Option<f64>,
    pub planet_temporal_span_days: Option<i64>,
    pub planet_latest_date: Option<String>,
    pub planet_earliest_date: Option<String>,
    pub planet_thumb_latest_url: Option<String>,
    pub planet_thumb_earliest_url: Option<String>,
    pub planet_scan_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UspsResult {
    pub parcel_id: String,
    pub county: String,
    /// Credential that produced the check; journaled as `_account`, never
    /// written to the store.
    #[serde(rename = "_account", skip_serializing_if = "Option::is_none", default)]
    pub account: Option<u32>,
    pub usps_vacant: Option<bool>,
    pub usps_dpv_confirmed: Option<bool>,
    pub usps_address: Option<String>,
    pub usps_city: Option<String>,
    pub usps_zip: Option<String>,
    pub usps_zip4: Option<String>,
    pub usps_business: Option<bool>,
    pub usps_carrier_route: Option<String>,
    pub usps_address_mismatch: bool,
    pub usps_error: Option<String>,
    pub flag_vacancy: bool,
    pub vacancy_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvictionResult {
    pub parcel_id: String,
    pub county: String,
    pub conviction_score: Option<f64>,
    pub conviction_base_score: Option<f64>,
    pub conviction_vacancy_bonus: f64,
    pub conviction_mc_score: Option<f64>,
    pub conviction_mc_signals: Option<i64>,
    pub conviction_mc_codes: Option<String>,
    pub conviction_components: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndvi_categories() {
        assert_eq!(NdviCategory::from_ndvi(Some(0.05)), NdviCategory::Bare);
        assert_eq!(NdviCategory::from_ndvi(Some(0.23)), NdviCategory::Minimal);
        assert_eq!(NdviCategory::from_ndvi(Some(0.42)), NdviCategory::Sparse);
        assert_eq!(NdviCategory::from_ndvi(Some(0.55)), NdviCategory::Moderate);
        assert_eq!(NdviCategory::from_ndvi(Some(0.80)), NdviCategory::Dense);
        assert_eq!(NdviCategory::from_ndvi(None), NdviCategory::NoData);
    }

    #[test]
    fn test_category_band_edges() {
        assert_eq!(NdviCategory::from_ndvi(Some(0.10)), NdviCategory::Minimal);
        assert_eq!(NdviCategory::from_ndvi(Some(0.30)), NdviCategory::Sparse);
        assert_eq!(NdviCategory::from_ndvi(Some(0.65)), NdviCategory::Dense);
    }

    #[test]
    fn test_fema_risk_roundtrip() {
        for r in [FemaRisk::High, FemaRisk::Moderate, FemaRisk::Low, FemaRisk::Unknown] {
            assert_eq!(FemaRisk::parse(r.as_str()), r);
        }
        assert_eq!(FemaRisk::parse("garbage"), FemaRisk::Unknown);
    }
}
