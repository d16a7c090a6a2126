//! Distress signal evaluators.
//!
//! Each evaluator is a pure function from collector outputs to an optional
//! fired flag with confidence and evidence. Thresholds here are design
//! constants; changing one is a scoring-model event, not a tuning knob.

use serde_json::{json, Value};

use crate::models::parcel::{FemaRisk, TrendDirection};
use crate::models::readings::{FloodZone, TrendSeries, VacancyCheck};
use crate::scoring::round_to;

// Vegetation neglect band (bare/abandoned lots)
const NDVI_NEGLECT_MIN: f64 = 0.10;
const NDVI_NEGLECT_MAX: f64 = 0.30;

// Vegetation overgrowth (two-tier)
const NDVI_OVERGROWTH_MODERATE: f64 = 0.50;
const NDVI_OVERGROWTH_STRONG: f64 = 0.65;
const NDVI_OVERGROWTH_CHANGE: f64 = 0.15;
const NDVI_TREND_INCREASING_SLOPE: f64 = 0.005;

// Structural change (demolition, fire, clearing)
const NDVI_DROP_THRESHOLD: f64 = 0.20;

const FLOOD_HIGH_CONFIDENCE: f64 = 1.0;
const FLOOD_MODERATE_CONFIDENCE: f64 = 0.6;

/// Weights rolling fired flags up into the 0-10 distress score.
pub fn signal_weight(code: SignalCode) -> f64 {
    match code {
        SignalCode::VegetationOvergrowth => 2.0,
        SignalCode::VegetationNeglect => 1.5,
        SignalCode::FloodRisk => 1.5,
        SignalCode::StructuralChange => 2.5,
        SignalCode::UspsVacancy => 2.5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalCode {
    VegetationOvergrowth,
    VegetationNeglect,
    FloodRisk,
    StructuralChange,
    UspsVacancy,
}

impl SignalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalCode::VegetationOvergrowth => "vegetation_overgrowth",
            SignalCode::VegetationNeglect => "vegetation_neglect",
            SignalCode::FloodRisk => "flood_risk",
            SignalCode::StructuralChange => "structural_change",
            SignalCode::UspsVacancy => "usps_vacancy",
        }
    }
}

/// A fired distress flag.
#[derive(Debug, Clone)]
pub struct SignalFlag {
    pub code: SignalCode,
    pub confidence: f64,
    pub evidence: Value,
}

/// Aerial inputs the vegetation evaluators consume. Built from the current
/// sample plus (when available) the historical vintage mean.
#[derive(Debug, Clone, Default)]
pub struct AerialInput {
    pub current_ndvi: Option<f64>,
    pub historical_mean: Option<f64>,
}

/// Vegetation overgrowth: yards/lots going feral.
///
/// Two aerial tiers (strong > 0.65, moderate 0.50-0.65 with historical
/// confirmation) and an independent trend fire; agreement boosts, a single
/// source discounts.
pub fn evaluate_vegetation_overgrowth(
    aerial: Option<&AerialInput>,
    trend: Option<&TrendSeries>,
) -> Option<SignalFlag> {
    let mut aerial_fire: Option<(f64, Value)> = None;
    let mut aerial_no_history = false;

    if let Some(a) = aerial {
        if let Some(current) = a.current_ndvi {
            if current > NDVI_OVERGROWTH_STRONG {
                match a.historical_mean {
                    Some(mean) if current > mean + NDVI_OVERGROWTH_CHANGE => {
                        let conf = ((current - mean) / 0.3).clamp(0.0, 1.0);
                        aerial_fire = Some((
                            conf,
                            json!({
                                "aerial_current_ndvi": current,
                                "aerial_historical_mean": mean,
                                "aerial_delta": round_to(current - mean, 4),
                                "tier": "strong",
                            }),
                        ));
                    }
                    None => {
                        // Very high NDVI with no baseline still fires,
                        // at a conservative fixed confidence.
                        aerial_no_history = true;
                        aerial_fire = Some((
                            0.6,
                            json!({
                                "aerial_current_ndvi": current,
                                "note": "no_historical_baseline",
                                "tier": "strong",
                            }),
                        ));
                    }
                    _ => {}
                }
            } else if current > NDVI_OVERGROWTH_MODERATE {
                if let Some(mean) = a.historical_mean {
                    if current > mean + NDVI_OVERGROWTH_CHANGE {
                        let conf = ((current - mean) / 0.3).min(0.8);
                        aerial_fire = Some((
                            conf,
                            json!({
                                "aerial_current_ndvi": current,
                                "aerial_historical_mean": mean,
                                "aerial_delta": round_to(current - mean, 4),
                                "tier": "moderate",
                            }),
                        ));
                    }
                }
            }
        }
    }

    let mut trend_fire: Option<(f64, Value)> = None;
    if let Some(t) = trend {
        if t.direction == TrendDirection::Increasing {
            if let (Some(slope), Some(latest)) = (t.slope, t.latest_ndvi) {
                if slope > NDVI_TREND_INCREASING_SLOPE && latest > NDVI_OVERGROWTH_MODERATE {
                    let conf = (slope / 0.02).clamp(0.0, 1.0);
                    trend_fire = Some((
                        conf,
                        json!({
                            "trend_slope": slope,
                            "trend_direction": "increasing",
                            "trend_latest_ndvi": latest,
                        }),
                    ));
                }
            }
        }
    }

    combine_two_source(
        SignalCode::VegetationOvergrowth,
        aerial_fire,
        trend_fire,
        aerial_no_history,
    )
}

/// Vegetation neglect: NDVI in the bare-lot band, lower = more confident.
/// Flood-zone coincidence compounds the distress.
pub fn evaluate_vegetation_neglect(
    aerial: Option<&AerialInput>,
    flood: Option<&FloodZone>,
) -> Option<SignalFlag> {
    let current = aerial?.current_ndvi?;
    if !(NDVI_NEGLECT_MIN..=NDVI_NEGLECT_MAX).contains(&current) {
        return None;
    }

    // 0.10 -> 1.0, 0.30 -> 0.3
    let mut confidence = round_to(
        1.0 - ((current - NDVI_NEGLECT_MIN) / (NDVI_NEGLECT_MAX - NDVI_NEGLECT_MIN)) * 0.7,
        2,
    );
    let mut evidence = json!({
        "aerial_current_ndvi": current,
        "category": "neglect",
    });

    if let Some(f) = flood {
        if matches!(f.risk, FemaRisk::High | FemaRisk::Moderate) {
            confidence = (confidence + 0.15).min(1.0);
            evidence["flood_boost"] = json!(true);
            evidence["flood_risk"] = json!(f.risk.as_str());
        }
    }

    Some(SignalFlag {
        code: SignalCode::VegetationNeglect,
        confidence,
        evidence,
    })
}

/// Flood risk: zone-based classification, no inference.
pub fn evaluate_flood_risk(flood: Option<&FloodZone>) -> Option<SignalFlag> {
    let f = flood?;
    let confidence = if f.is_sfha || f.risk == FemaRisk::High {
        FLOOD_HIGH_CONFIDENCE
    } else if f.risk == FemaRisk::Moderate {
        FLOOD_MODERATE_CONFIDENCE
    } else {
        return None;
    };

    let mut evidence = json!({
        "flood_zone": f.zone,
        "risk_level": f.risk.as_str(),
        "is_sfha": f.is_sfha,
        "zone_subtype": f.zone_subtype,
    });
    if let Some(url) = &f.map_url {
        evidence["map_url"] = json!(url);
    }

    Some(SignalFlag {
        code: SignalCode::FloodRisk,
        confidence,
        evidence,
    })
}

/// Structural change: a significant NDVI drop against the baseline or a
/// decreasing trend with a large earliest-to-latest fall.
pub fn evaluate_structural_change(
    aerial: Option<&AerialInput>,
    trend: Option<&TrendSeries>,
) -> Option<SignalFlag> {
    let mut aerial_fire: Option<(f64, Value)> = None;
    if let Some(a) = aerial {
        if let (Some(current), Some(mean)) = (a.current_ndvi, a.historical_mean) {
            let drop = mean - current;
            if drop > NDVI_DROP_THRESHOLD {
                let conf = (drop / 0.4).clamp(0.0, 1.0);
                aerial_fire = Some((
                    conf,
                    json!({
                        "aerial_current_ndvi": current,
                        "aerial_historical_mean": mean,
                        "aerial_drop": round_to(drop, 4),
                    }),
                ));
            }
        }
    }

    let mut trend_fire: Option<(f64, Value)> = None;
    if let Some(t) = trend {
        if t.direction == TrendDirection::Decreasing {
            if let (Some(slope), Some(earliest), Some(latest)) =
                (t.slope, t.earliest_ndvi, t.latest_ndvi)
            {
                if earliest - latest > NDVI_DROP_THRESHOLD {
                    let conf = (slope.abs() / 0.02).clamp(0.0, 1.0);
                    trend_fire = Some((
                        conf,
                        json!({
                            "trend_slope": slope,
                            "trend_drop": round_to(earliest - latest, 4),
                            "trend_latest_ndvi": latest,
                        }),
                    ));
                }
            }
        }
    }

    combine_two_source(SignalCode::StructuralChange, aerial_fire, trend_fire, false)
}

/// Carrier-confirmed vacancy. The carrier flags an address after 90+ days of
/// uncollected mail; DPV tells us the address itself is real.
pub fn evaluate_usps_vacancy(usps: Option<&VacancyCheck>) -> Option<SignalFlag> {
    let u = usps?;
    if u.vacant != Some(true) {
        return None;
    }

    let mut confidence: f64 = match u.dpv_confirmed {
        Some(true) => 0.90,
        Some(false) | None => 0.75,
    };
    if u.address_mismatch {
        confidence = confidence.min(0.70);
    }

    Some(SignalFlag {
        code: SignalCode::UspsVacancy,
        confidence,
        evidence: json!({
            "source": "usps_address_api_v3",
            "vacant": true,
            "dpv_confirmed": u.dpv_confirmed,
            "address_mismatch": u.address_mismatch,
            "usps_address": u.usps_address,
            "usps_city": u.usps_city,
            "usps_zip": u.usps_zip,
            "carrier_route": u.carrier_route,
        }),
    })
}

/// Two-source combination rule shared by overgrowth and structural change:
/// agreement boosts past either single source, a lone source is discounted
/// (0.8 aerial, 0.7 trend). A strong no-baseline aerial fire already carries
/// a conservative confidence and keeps it undiscounted.
fn combine_two_source(
    code: SignalCode,
    aerial: Option<(f64, Value)>,
    trend: Option<(f64, Value)>,
    aerial_no_history: bool,
) -> Option<SignalFlag> {
    match (aerial, trend) {
        (Some((ac, mut ae)), Some((tc, te))) => {
            merge_evidence(&mut ae, te);
            ae["agreement"] = json!("aerial_and_trend");
            Some(SignalFlag {
                code,
                confidence: (ac.max(tc) + 0.2).min(1.0),
                evidence: ae,
            })
        }
        (Some((ac, mut ae)), None) => {
            ae["source"] = json!("aerial_only");
            let confidence = if aerial_no_history { ac } else { ac * 0.8 };
            Some(SignalFlag {
                code,
                confidence,
                evidence: ae,
            })
        }
        (None, Some((tc, mut te))) => {
            te["source"] = json!("trend_only");
            Some(SignalFlag {
                code,
                confidence: tc * 0.7,
                evidence: te,
            })
        }
        (None, None) => None,
    }
}

fn merge_evidence(into: &mut Value, from: Value) {
    if let (Some(dst), Some(src)) = (into.as_object_mut(), from.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
}

/// Run all evaluators and keep the fired flags.
pub fn generate_all_flags(
    aerial: Option<&AerialInput>,
    trend: Option<&TrendSeries>,
    flood: Option<&FloodZone>,
    usps: Option<&VacancyCheck>,
) -> Vec<SignalFlag> {
    let flags: Vec<SignalFlag> = [
        evaluate_vegetation_overgrowth(aerial, trend),
        evaluate_vegetation_neglect(aerial, flood),
        evaluate_flood_risk(flood),
        evaluate_structural_change(aerial, trend),
        evaluate_usps_vacancy(usps),
    ]
    .into_iter()
    .flatten()
    .collect();

    tracing::debug!(
        fired = flags.len(),
        codes = ?flags.iter().map(|f| f.code.as_str()).collect::<Vec<_>>(),
        "flags evaluated"
    );
    flags
}

/// Flag rollup destined for the parcel row.
#[derive(Debug, Clone, Default)]
pub struct FlagRollup {
    pub distress_score: f64,
    pub distress_flags: Option<String>,
    pub flag_veg_overgrowth: bool,
    pub flag_veg_neglect: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
}

impl FlagRollup {
    pub fn from_flags(flags: &[SignalFlag]) -> Self {
        let mut score = 0.0;
        for flag in flags {
            score += signal_weight(flag.code) * flag.confidence;
        }
        let score = round_to(score.min(10.0), 2);

        let conf = |code: SignalCode| {
            flags
                .iter()
                .find(|f| f.code == code)
                .map(|f| f.confidence)
        };

        let mut codes: Vec<&str> = flags.iter().map(|f| f.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();

        let overgrowth = conf(SignalCode::VegetationOvergrowth);
        let neglect = conf(SignalCode::VegetationNeglect);
        let veg_confidence = match (overgrowth, neglect) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0).max(b.unwrap_or(0.0))),
        };

        Self {
            distress_score: score,
            distress_flags: if codes.is_empty() {
                None
            } else {
                Some(codes.join(","))
            },
            flag_veg_overgrowth: overgrowth.is_some(),
            flag_veg_neglect: neglect.is_some(),
            flag_flood: conf(SignalCode::FloodRisk).is_some(),
            flag_structural: conf(SignalCode::StructuralChange).is_some(),
            veg_confidence,
            flood_confidence: conf(SignalCode::FloodRisk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parcel::TrendSource;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual}"
        );
    }

    fn aerial(current: f64, mean: Option<f64>) -> AerialInput {
        AerialInput {
            current_ndvi: Some(current),
            historical_mean: mean,
        }
    }

    fn flood(risk: FemaRisk, sfha: bool) -> FloodZone {
        FloodZone {
            zone: Some("AE".into()),
            is_sfha: sfha,
            risk,
            zone_subtype: None,
            map_url: None,
        }
    }

    fn trend(direction: TrendDirection, slope: f64, latest: f64, earliest: f64) -> TrendSeries {
        TrendSeries {
            monthly: Vec::new(),
            slope: Some(slope),
            direction,
            months_with_data: 10,
            latest_ndvi: Some(latest),
            earliest_ndvi: Some(earliest),
            mean_ndvi: None,
            source: TrendSource::Primary,
        }
    }

    // ── Overgrowth ──

    #[test]
    fn test_overgrowth_strong_tier_with_history() {
        let a = aerial(0.75, Some(0.50));
        let flag = evaluate_vegetation_overgrowth(Some(&a), None).unwrap();
        // delta 0.25 / 0.3, discounted 0.8 for single source
        assert_approx(flag.confidence, 0.25 / 0.3 * 0.8, 1e-9);
        assert_eq!(flag.evidence["tier"], "strong");
    }

    #[test]
    fn test_overgrowth_strong_no_history_keeps_fixed_confidence() {
        let a = aerial(0.80, None);
        let flag = evaluate_vegetation_overgrowth(Some(&a), None).unwrap();
        assert_approx(flag.confidence, 0.6, 1e-9);
        assert_eq!(flag.evidence["note"], "no_historical_baseline");
    }

    #[test]
    fn test_overgrowth_moderate_requires_history() {
        let without = aerial(0.60, None);
        assert!(evaluate_vegetation_overgrowth(Some(&without), None).is_none());

        let with = aerial(0.60, Some(0.40));
        let flag = evaluate_vegetation_overgrowth(Some(&with), None).unwrap();
        assert_eq!(flag.evidence["tier"], "moderate");
        assert!(flag.confidence <= 0.8);
    }

    #[test]
    fn test_overgrowth_agreement_boost() {
        let a = aerial(0.75, Some(0.50));
        let t = trend(TrendDirection::Increasing, 0.010, 0.72, 0.55);
        let flag = evaluate_vegetation_overgrowth(Some(&a), Some(&t)).unwrap();
        let aerial_conf: f64 = 0.25 / 0.3;
        let trend_conf: f64 = 0.010 / 0.02;
        assert_approx(flag.confidence, (aerial_conf.max(trend_conf) + 0.2).min(1.0), 1e-9);
        assert_eq!(flag.evidence["agreement"], "aerial_and_trend");
    }

    #[test]
    fn test_overgrowth_trend_only_discount() {
        let t = trend(TrendDirection::Increasing, 0.010, 0.72, 0.55);
        let flag = evaluate_vegetation_overgrowth(None, Some(&t)).unwrap();
        assert_approx(flag.confidence, 0.5 * 0.7, 1e-9);
    }

    #[test]
    fn test_overgrowth_trend_needs_high_latest() {
        let t = trend(TrendDirection::Increasing, 0.010, 0.40, 0.30);
        assert!(evaluate_vegetation_overgrowth(None, Some(&t)).is_none());
    }

    // ── Neglect ──

    #[test]
    fn test_neglect_confidence_in_band() {
        let a = aerial(0.23, None);
        let flag = evaluate_vegetation_neglect(Some(&a), None).unwrap();
        assert_approx(flag.confidence, 0.55, 1e-9);
    }

    #[test]
    fn test_neglect_band_edges() {
        let low = aerial(0.10, None);
        assert_approx(
            evaluate_vegetation_neglect(Some(&low), None).unwrap().confidence,
            1.0,
            1e-9,
        );
        let high = aerial(0.30, None);
        assert_approx(
            evaluate_vegetation_neglect(Some(&high), None).unwrap().confidence,
            0.3,
            1e-9,
        );
        let below = aerial(0.05, None);
        assert!(evaluate_vegetation_neglect(Some(&below), None).is_none());
        let above = aerial(0.35, None);
        assert!(evaluate_vegetation_neglect(Some(&above), None).is_none());
    }

    #[test]
    fn test_neglect_flood_boost() {
        let a = aerial(0.20, None);
        let f = flood(FemaRisk::High, true);
        let base = evaluate_vegetation_neglect(Some(&a), None).unwrap().confidence;
        let boosted = evaluate_vegetation_neglect(Some(&a), Some(&f)).unwrap();
        assert_approx(boosted.confidence, (base + 0.15).min(1.0), 1e-9);
        assert_eq!(boosted.evidence["flood_boost"], true);
    }

    // ── Flood ──

    #[test]
    fn test_flood_high_and_moderate() {
        let high = evaluate_flood_risk(Some(&flood(FemaRisk::High, true))).unwrap();
        assert_eq!(high.confidence, 1.0);
        let moderate = evaluate_flood_risk(Some(&flood(FemaRisk::Moderate, false))).unwrap();
        assert_eq!(moderate.confidence, 0.6);
        assert!(evaluate_flood_risk(Some(&flood(FemaRisk::Low, false))).is_none());
        assert!(evaluate_flood_risk(None).is_none());
    }

    #[test]
    fn test_flood_sfha_overrides_low_risk() {
        let f = flood(FemaRisk::Low, true);
        assert_eq!(evaluate_flood_risk(Some(&f)).unwrap().confidence, 1.0);
    }

    // ── Structural ──

    #[test]
    fn test_structural_drop_fires() {
        let a = aerial(0.25, Some(0.55));
        let flag = evaluate_structural_change(Some(&a), None).unwrap();
        assert_approx(flag.confidence, 0.30 / 0.4 * 0.8, 1e-9);
    }

    #[test]
    fn test_structural_small_drop_does_not_fire() {
        let a = aerial(0.45, Some(0.55));
        assert!(evaluate_structural_change(Some(&a), None).is_none());
    }

    #[test]
    fn test_structural_trend_decreasing() {
        let t = trend(TrendDirection::Decreasing, -0.015, 0.20, 0.50);
        let flag = evaluate_structural_change(None, Some(&t)).unwrap();
        assert_approx(flag.confidence, 0.75 * 0.7, 1e-9);
    }

    // ── Vacancy ──

    #[test]
    fn test_vacancy_confidence_ladder() {
        let mut check = VacancyCheck {
            vacant: Some(true),
            dpv_confirmed: Some(true),
            business: None,
            carrier_route: None,
            usps_address: None,
            usps_city: None,
            usps_state: None,
            usps_zip: None,
            usps_zip4: None,
            address_mismatch: false,
        };
        assert_approx(evaluate_usps_vacancy(Some(&check)).unwrap().confidence, 0.90, 1e-9);

        check.dpv_confirmed = None;
        assert_approx(evaluate_usps_vacancy(Some(&check)).unwrap().confidence, 0.75, 1e-9);

        check.dpv_confirmed = Some(true);
        check.address_mismatch = true;
        assert_approx(evaluate_usps_vacancy(Some(&check)).unwrap().confidence, 0.70, 1e-9);

        check.vacant = Some(false);
        assert!(evaluate_usps_vacancy(Some(&check)).is_none());
    }

    // ── Rollup ──

    #[test]
    fn test_rollup_single_parcel_scenario() {
        // Minimal-vegetation parcel in zone X: neglect fires at 0.55,
        // distress score 1.5 * 0.55.
        let a = aerial(0.23, None);
        let f = FloodZone {
            zone: Some("X".into()),
            is_sfha: false,
            risk: FemaRisk::Low,
            zone_subtype: None,
            map_url: None,
        };
        let flags = generate_all_flags(Some(&a), None, Some(&f), None);
        assert_eq!(flags.len(), 1);
        let rollup = FlagRollup::from_flags(&flags);
        assert!(rollup.flag_veg_neglect);
        assert!(!rollup.flag_flood);
        assert_approx(rollup.distress_score, 0.83, 1e-9);
        assert_eq!(rollup.distress_flags.as_deref(), Some("vegetation_neglect"));
        assert_approx(rollup.veg_confidence.unwrap(), 0.55, 1e-9);
        assert!(rollup.flood_confidence.is_none());
    }

    #[test]
    fn test_rollup_score_clamped() {
        let flags = vec![
            SignalFlag {
                code: SignalCode::VegetationOvergrowth,
                confidence: 1.0,
                evidence: json!({}),
            },
            SignalFlag {
                code: SignalCode::StructuralChange,
                confidence: 1.0,
                evidence: json!({}),
            },
            SignalFlag {
                code: SignalCode::FloodRisk,
                confidence: 1.0,
                evidence: json!({}),
            },
            SignalFlag {
                code: SignalCode::UspsVacancy,
                confidence: 1.0,
                evidence: json!({}),
            },
            SignalFlag {
                code: SignalCode::VegetationNeglect,
                confidence: 1.0,
                evidence: json!({}),
            },
        ];
        let rollup = FlagRollup::from_flags(&flags);
        assert_eq!(rollup.distress_score, 10.0);
    }

    #[test]
    fn test_rollup_empty() {
        let rollup = FlagRollup::from_flags(&[]);
        assert_eq!(rollup.distress_score, 0.0);
        assert!(rollup.distress_flags.is_none());
    }
}
