//! Pure metric kernels: NDVI slope, county percentile ranks, the distress
//! composite, and conviction fusion.

/// Conviction model constants, v1.0.
pub const W_DS: f64 = 0.35;
pub const W_MC: f64 = 0.40;
pub const MC_CAP: f64 = 7.0;
pub const VAC_BONUS_MAX: f64 = 2.5;
pub const MODEL_VERSION: &str = "v1.0";

/// Composite default weights.
pub const DEFAULT_NDVI_WEIGHT: f64 = 0.70;
pub const DEFAULT_FEMA_WEIGHT: f64 = 0.30;

pub fn round_to(x: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (x * factor).round() / factor
}

/// Least-squares slope over (year, ndvi) points, NDVI change per year.
///
/// Fewer than 2 points has no defined trend; a degenerate x spread (all the
/// same year) reads as flat rather than NaN.
pub fn ndvi_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| p.0).sum();
    let sum_y: f64 = points.iter().map(|p| p.1).sum();
    let sum_xy: f64 = points.iter().map(|p| p.0 * p.1).sum();
    let sum_x2: f64 = points.iter().map(|p| p.0 * p.0).sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return Some(0.0);
    }
    Some(round_to((n * sum_xy - sum_x * sum_y) / denom, 6))
}

/// Slope over equally spaced samples (monthly series), x = sample index.
pub fn index_slope(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as f64, v))
        .collect();
    ndvi_slope(&points)
}

/// Percentile ranks within one county partition.
///
/// Input is (parcel_id, slope) for every parcel with a non-null slope.
/// Rank is the 0-indexed position after an ascending stable sort on slope,
/// scaled to [0, 100]; higher slope (more overgrowth) ranks higher. Ties
/// keep their input order. A single-parcel partition ranks 100.
pub fn percentile_ranks(slopes: &[(String, f64)]) -> Vec<(String, f64)> {
    let count = slopes.len();
    if count == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|&a, &b| {
        slopes[a]
            .1
            .partial_cmp(&slopes[b].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = Vec::with_capacity(count);
    for (rank, &idx) in order.iter().enumerate() {
        let pctile = if count == 1 {
            100.0
        } else {
            rank as f64 / (count - 1) as f64 * 100.0
        };
        out.push((slopes[idx].0.clone(), round_to(pctile, 4)));
    }
    out
}

/// Flood contribution on the composite's 0-10 scale.
pub fn fema_weight_score(risk: Option<&str>, sfha: bool) -> f64 {
    if sfha {
        return 10.0;
    }
    match risk {
        Some("high") => 10.0,
        Some("moderate") => 6.0,
        Some("low") => 2.0,
        _ => 0.0,
    }
}

/// Distress composite: bulk risk from overgrowth percentile + flood.
///
/// Defined only when at least one input is known; a parcel with neither
/// slope nor flood data stays unranked.
pub fn distress_composite(
    slope_pctile: Option<f64>,
    fema_risk: Option<&str>,
    fema_sfha: bool,
    has_fema: bool,
    ndvi_weight: f64,
    fema_weight: f64,
) -> Option<f64> {
    if slope_pctile.is_none() && !has_fema {
        return None;
    }
    let ndvi_term = slope_pctile.unwrap_or(0.0) / 10.0;
    let fema_term = fema_weight_score(fema_risk, fema_sfha);
    Some(round_to(ndvi_weight * ndvi_term + fema_weight * fema_term, 2))
}

/// Conviction fusion output.
#[derive(Debug, Clone, PartialEq)]
pub struct Conviction {
    pub score: Option<f64>,
    pub base_score: Option<f64>,
    pub vacancy_bonus: f64,
    /// Ordered subset of {DS, MC, VAC} that contributed.
    pub components: Vec<&'static str>,
}

/// Fuse distress composite, motivation aggregates, and carrier vacancy into
/// the conviction score.
///
/// Missing evidence is excluded and the remaining weights rescaled: a parcel
/// with no motivation coverage is not penalized as if the evidence were
/// zero. Score is null only when DS and MC are both absent and no vacancy
/// bonus applies.
pub fn conviction(
    ds_composite: Option<f64>,
    mc_raw: f64,
    mc_count: i64,
    flag_vacancy: bool,
    vac_conf: Option<f64>,
    usps_error: bool,
) -> Conviction {
    let ds_comp = ds_composite.map(|d| (d / 10.0).clamp(0.0, 1.0));
    let mc_comp = if mc_count > 0 {
        Some((mc_raw / MC_CAP).clamp(0.0, 1.0))
    } else {
        None
    };

    let vac_bonus = if flag_vacancy && !usps_error {
        VAC_BONUS_MAX * vac_conf.unwrap_or(0.8).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let denom = ds_comp.map_or(0.0, |_| W_DS) + mc_comp.map_or(0.0, |_| W_MC);

    if denom == 0.0 && vac_bonus == 0.0 {
        return Conviction {
            score: None,
            base_score: None,
            vacancy_bonus: round_to(vac_bonus, 2),
            components: Vec::new(),
        };
    }

    let base = if denom > 0.0 {
        10.0 * (W_DS * ds_comp.unwrap_or(0.0) + W_MC * mc_comp.unwrap_or(0.0)) / denom
    } else {
        0.0
    };
    let score = round_to((base + vac_bonus).clamp(0.0, 10.0), 2);

    let mut components = Vec::new();
    if ds_comp.is_some() {
        components.push("DS");
    }
    if mc_comp.is_some() {
        components.push("MC");
    }
    if vac_bonus > 0.0 {
        components.push("VAC");
    }

    Conviction {
        score: Some(score),
        base_score: Some(round_to(base, 2)),
        vacancy_bonus: round_to(vac_bonus, 2),
        components,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    // ── Slope ──

    #[test]
    fn test_slope_increasing_history() {
        let points = [
            (2014.0, 0.30),
            (2016.0, 0.33),
            (2018.0, 0.38),
            (2020.0, 0.45),
            (2022.0, 0.50),
        ];
        let slope = ndvi_slope(&points).unwrap();
        assert_approx(slope, 0.026, 0.001);
    }

    #[test]
    fn test_slope_needs_two_points() {
        assert_eq!(ndvi_slope(&[]), None);
        assert_eq!(ndvi_slope(&[(2020.0, 0.4)]), None);
    }

    #[test]
    fn test_slope_zero_denominator() {
        // Two samples from the same year: flat, not NaN.
        let slope = ndvi_slope(&[(2020.0, 0.2), (2020.0, 0.6)]).unwrap();
        assert_eq!(slope, 0.0);
        assert!(slope.is_finite());
    }

    #[test]
    fn test_slope_flat_series() {
        let slope = ndvi_slope(&[(2018.0, 0.4), (2020.0, 0.4), (2022.0, 0.4)]).unwrap();
        assert_approx(slope, 0.0, 1e-9);
    }

    #[test]
    fn test_index_slope_short_series() {
        assert_eq!(index_slope(&[0.1, 0.2]), None);
        assert!(index_slope(&[0.1, 0.2, 0.3]).is_some());
    }

    // ── Percentiles ──

    #[test]
    fn test_percentile_span_and_monotonicity() {
        let slopes: Vec<(String, f64)> = (0..5)
            .map(|i| (format!("P{i}"), i as f64 * 0.01))
            .collect();
        let ranks = percentile_ranks(&slopes);
        assert_eq!(ranks.len(), 5);
        assert_eq!(ranks[0], ("P0".to_string(), 0.0));
        assert_eq!(ranks[4], ("P4".to_string(), 100.0));
        // Monotone in slope
        for w in ranks.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
    }

    #[test]
    fn test_percentile_ties_are_stable() {
        let slopes = vec![
            ("A".to_string(), 0.01),
            ("B".to_string(), 0.01),
            ("C".to_string(), 0.02),
        ];
        let ranks = percentile_ranks(&slopes);
        assert_eq!(ranks[0].0, "A");
        assert_eq!(ranks[1].0, "B");
        assert_eq!(ranks[2].0, "C");
    }

    #[test]
    fn test_percentile_singleton_partition() {
        let ranks = percentile_ranks(&[("only".to_string(), 0.003)]);
        assert_eq!(ranks, vec![("only".to_string(), 100.0)]);
    }

    #[test]
    fn test_percentile_empty() {
        assert!(percentile_ranks(&[]).is_empty());
    }

    // ── Composite ──

    #[test]
    fn test_composite_defaults() {
        // pctile 80, high flood risk: 0.70*8 + 0.30*10
        let c = distress_composite(
            Some(80.0),
            Some("high"),
            false,
            true,
            DEFAULT_NDVI_WEIGHT,
            DEFAULT_FEMA_WEIGHT,
        )
        .unwrap();
        assert_approx(c, 8.6, 1e-9);
    }

    #[test]
    fn test_composite_zone_x_low_contributes_nothing_from_slope_absent() {
        // FEMA-only parcel in a low-risk zone
        let c = distress_composite(None, Some("low"), false, true, 0.70, 0.30).unwrap();
        assert_approx(c, 0.6, 1e-9);
    }

    #[test]
    fn test_composite_requires_some_input() {
        assert_eq!(distress_composite(None, None, false, false, 0.70, 0.30), None);
    }

    #[test]
    fn test_fema_weight_scores() {
        assert_eq!(fema_weight_score(Some("high"), false), 10.0);
        assert_eq!(fema_weight_score(Some("low"), true), 10.0); // SFHA dominates
        assert_eq!(fema_weight_score(Some("moderate"), false), 6.0);
        assert_eq!(fema_weight_score(Some("low"), false), 2.0);
        assert_eq!(fema_weight_score(None, false), 0.0);
        assert_eq!(fema_weight_score(Some("unknown"), false), 0.0);
    }

    // ── Conviction ──

    #[test]
    fn test_conviction_ds_only() {
        let c = conviction(Some(6.0), 0.0, 0, false, None, false);
        assert_eq!(c.score, Some(6.00));
        assert_eq!(c.base_score, Some(6.00));
        assert_eq!(c.vacancy_bonus, 0.0);
        assert_eq!(c.components, vec!["DS"]);
    }

    #[test]
    fn test_conviction_mc_only_with_vacancy() {
        let c = conviction(None, 4.2, 3, true, Some(0.9), false);
        assert_eq!(c.score, Some(8.25));
        assert_eq!(c.base_score, Some(6.00));
        assert_eq!(c.vacancy_bonus, 2.25);
        assert_eq!(c.components, vec!["MC", "VAC"]);
    }

    #[test]
    fn test_conviction_null_when_no_components() {
        let c = conviction(None, 0.0, 0, false, None, false);
        assert_eq!(c.score, None);
        assert_eq!(c.base_score, None);
        assert!(c.components.is_empty());
    }

    #[test]
    fn test_conviction_vacancy_suppressed_by_usps_error() {
        let c = conviction(Some(5.0), 0.0, 0, true, Some(0.9), true);
        assert_eq!(c.vacancy_bonus, 0.0);
        assert_eq!(c.components, vec!["DS"]);
    }

    #[test]
    fn test_conviction_vacancy_only() {
        // No DS, no MC, but a clean vacancy flag still produces a score.
        let c = conviction(None, 0.0, 0, true, None, false);
        assert_eq!(c.score, Some(2.0)); // 2.5 * default 0.8
        assert_eq!(c.base_score, Some(0.0));
        assert_eq!(c.components, vec!["VAC"]);
    }

    #[test]
    fn test_conviction_missing_mc_is_not_zero_mc() {
        // DS=8 with no MC evidence must NOT be dragged down by an implied
        // MC=0: weights rescale instead.
        let without_mc = conviction(Some(8.0), 0.0, 0, false, None, false);
        let with_zero_mc = conviction(Some(8.0), 0.0, 5, false, None, false);
        assert_eq!(without_mc.score, Some(8.00));
        assert!(with_zero_mc.score.unwrap() < without_mc.score.unwrap());
    }

    #[test]
    fn test_conviction_clamped_to_ten() {
        let c = conviction(Some(10.0), 70.0, 9, true, Some(1.0), false);
        assert_eq!(c.score, Some(10.0));
    }

    #[test]
    fn test_mc_raw_capped() {
        // mc_raw above the cap saturates the MC component at 1.0.
        let c = conviction(None, 21.0, 4, false, None, false);
        assert_eq!(c.base_score, Some(10.0));
    }
}
