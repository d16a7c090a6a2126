//! Pass 1: aerial NDVI + flood zone over every unscanned parcel.

use std::sync::Arc;
use std::time::Instant;

use crate::collectors::aerial::AerialClient;
use crate::collectors::flood::FloodClient;
use crate::error::ErrorTag;
use crate::evaluators::{generate_all_flags, AerialInput, FlagRollup};
use crate::models::parcel::{NdviCategory, ScanResult, UnscannedParcel};
use crate::models::readings::AerialSample;
use crate::scheduler::{self, PoolConfig, Unit};
use crate::store::now_timestamp;

use super::{outcome_of, print_pool_summary, EngineContext, PassOutcome};

pub struct Pass1Args {
    pub county: String,
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub workers: usize,
    pub flush_every: usize,
    pub dry_run: bool,
    pub property_class: Option<String>,
}

/// Parcels above this NDVI get trend enrichment even without a fired flag.
const SENTINEL_WORTHY_NDVI: f64 = 0.50;

pub async fn run(ctx: &EngineContext, args: Pass1Args) -> anyhow::Result<PassOutcome> {
    println!("\n=== Pass 1: Aerial NDVI + Flood Scan — {} ===", args.county);
    println!(
        "    Workers: {} | Flush every: {}{}",
        args.workers,
        args.flush_every,
        if args.dry_run { " | DRY RUN" } else { "" }
    );

    // Migration runs even for dry-run: the selectors need the columns.
    println!("  Running migration...");
    ctx.store.migrate()?;

    println!("  Loading unscanned parcels...");
    let parcels = ctx.store.select_unscanned(
        &args.county,
        args.state.as_deref(),
        args.property_class.as_deref(),
        args.limit,
    )?;
    println!("  Found {} unscanned parcels", parcels.len());
    if parcels.is_empty() {
        println!("  Nothing to scan. 0 processed.");
        return Ok(PassOutcome::Completed);
    }

    let aerial = Arc::new(AerialClient::new(ctx.config.cache_subdir("aerial")));
    let flood = Arc::new(FloodClient::new(ctx.config.cache_subdir("flood")));
    let shutdown = scheduler::spawn_shutdown_listener();

    let store = ctx.store.clone();
    let dry_run = args.dry_run;
    let flush: Arc<dyn Fn(&[ScanResult]) -> anyhow::Result<usize> + Send + Sync> =
        Arc::new(move |rows| {
            if dry_run {
                for r in rows {
                    print_dry_row(r);
                }
                return Ok(rows.len());
            }
            store.update_batch_scan(rows)
        });

    let start = Instant::now();
    let summary = scheduler::run_parallel(
        parcels,
        PoolConfig::new("pass1_scan", args.workers, args.flush_every),
        shutdown,
        move |parcel: UnscannedParcel| {
            let aerial = aerial.clone();
            let flood = flood.clone();
            async move { scan_parcel(&aerial, &flood, parcel).await }
        },
        flush,
    )
    .await;

    print_pool_summary("Scan Complete", &summary, start.elapsed().as_secs_f64());
    Ok(outcome_of(&summary))
}

async fn scan_parcel(
    aerial: &AerialClient,
    flood: &FloodClient,
    parcel: UnscannedParcel,
) -> Unit<ScanResult> {
    let sample = match aerial.current(parcel.latitude, parcel.longitude).await {
        Ok(sample) => sample,
        Err(e) if e.tag() == ErrorTag::Transient => {
            // Leave scan_date NULL so the next run picks this parcel up.
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "aerial transient failure");
            return Unit::Error;
        }
        Err(e) => {
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "aerial permanent failure");
            return Unit::ErrorRow(error_row(&parcel));
        }
    };

    // Flood degrades gracefully: a parcel without flood data still scans.
    let flood_zone = match flood.query(parcel.latitude, parcel.longitude).await {
        Ok(zone) => Some(zone),
        Err(e) => {
            tracing::debug!(parcel_id = %parcel.parcel_id, error = %e, "flood lookup skipped");
            None
        }
    };

    Unit::Row(build_scan_result(&parcel, &sample, flood_zone.as_ref()))
}

pub(crate) fn build_scan_result(
    parcel: &UnscannedParcel,
    sample: &AerialSample,
    flood: Option<&crate::models::readings::FloodZone>,
) -> ScanResult {
    let aerial_input = AerialInput {
        current_ndvi: sample.ndvi,
        historical_mean: None,
    };
    let flags = generate_all_flags(Some(&aerial_input), None, flood, None);
    let rollup = FlagRollup::from_flags(&flags);

    let sentinel_worthy =
        sample.ndvi.is_some_and(|n| n > SENTINEL_WORTHY_NDVI) || !flags.is_empty();

    ScanResult {
        parcel_id: parcel.parcel_id.clone(),
        county: parcel.county.clone(),
        ndvi_current: sample.ndvi,
        ndvi_date: sample.date.clone(),
        ndvi_category: sample.category,
        fema_zone: flood.and_then(|f| f.zone.clone()),
        fema_risk: flood.map(|f| f.risk.as_str().to_string()),
        fema_sfha: flood.map(|f| f.is_sfha).unwrap_or(false),
        distress_score: Some(rollup.distress_score),
        distress_flags: rollup.distress_flags,
        flag_veg_overgrowth: rollup.flag_veg_overgrowth,
        flag_veg_neglect: rollup.flag_veg_neglect,
        flag_flood: rollup.flag_flood,
        flag_structural: rollup.flag_structural,
        veg_confidence: rollup.veg_confidence,
        flood_confidence: rollup.flood_confidence,
        scan_date: now_timestamp(),
        scan_pass: 1.0,
        sentinel_worthy,
    }
}

/// Permanent failure: mark the parcel scanned so it stops being re-selected,
/// with an error category and no scores.
fn error_row(parcel: &UnscannedParcel) -> ScanResult {
    ScanResult {
        parcel_id: parcel.parcel_id.clone(),
        county: parcel.county.clone(),
        ndvi_current: None,
        ndvi_date: None,
        ndvi_category: NdviCategory::Error,
        fema_zone: None,
        fema_risk: None,
        fema_sfha: false,
        distress_score: None,
        distress_flags: None,
        flag_veg_overgrowth: false,
        flag_veg_neglect: false,
        flag_flood: false,
        flag_structural: false,
        veg_confidence: None,
        flood_confidence: None,
        scan_date: now_timestamp(),
        scan_pass: 1.0,
        sentinel_worthy: false,
    }
}

fn print_dry_row(r: &ScanResult) {
    let ndvi_str = r
        .ndvi_current
        .map(|n| format!("{n:.3}"))
        .unwrap_or_else(|| "NULL".to_string());
    let score_str = r
        .distress_score
        .map(|s| format!("{s:.1}"))
        .unwrap_or_else(|| "--".to_string());
    println!(
        "  [DRY] {} NDVI={ndvi_str} cat={} score={score_str} flags={}",
        r.parcel_id,
        r.ndvi_category.as_str(),
        r.distress_flags.as_deref().unwrap_or("--"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parcel::FemaRisk;
    use crate::models::readings::FloodZone;

    fn parcel() -> UnscannedParcel {
        UnscannedParcel {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            state_code: "NC".into(),
            latitude: 35.2271,
            longitude: -80.8431,
        }
    }

    #[test]
    fn test_scan_result_single_parcel_scenario() {
        // Aerial 0.23 / zone X low risk: neglect fires at 0.55, score 0.83,
        // sentinel-worthy because a flag fired.
        let sample = AerialSample {
            ndvi: Some(0.23),
            date: Some("2022-06-15".into()),
            category: NdviCategory::from_ndvi(Some(0.23)),
        };
        let flood = FloodZone {
            zone: Some("X".into()),
            is_sfha: false,
            risk: FemaRisk::Low,
            zone_subtype: None,
            map_url: None,
        };
        let result = build_scan_result(&parcel(), &sample, Some(&flood));

        assert_eq!(result.ndvi_category, NdviCategory::Minimal);
        assert!(result.flag_veg_neglect);
        assert!(!result.flag_flood);
        assert_eq!(result.veg_confidence, Some(0.55));
        assert_eq!(result.distress_score, Some(0.83));
        assert_eq!(result.fema_zone.as_deref(), Some("X"));
        assert_eq!(result.fema_risk.as_deref(), Some("low"));
        assert!(!result.fema_sfha);
        assert!(result.sentinel_worthy);
        assert_eq!(result.scan_pass, 1.0);
    }

    #[test]
    fn test_high_ndvi_is_sentinel_worthy_without_flags() {
        // 0.55 NDVI fires nothing (moderate tier needs history) but is
        // still worth trend enrichment.
        let sample = AerialSample {
            ndvi: Some(0.55),
            date: None,
            category: NdviCategory::from_ndvi(Some(0.55)),
        };
        let result = build_scan_result(&parcel(), &sample, None);
        assert!(!result.flag_veg_overgrowth);
        assert_eq!(result.distress_score, Some(0.0));
        assert!(result.sentinel_worthy);
    }

    #[test]
    fn test_quiet_parcel_is_not_sentinel_worthy() {
        let sample = AerialSample {
            ndvi: Some(0.35),
            date: None,
            category: NdviCategory::from_ndvi(Some(0.35)),
        };
        let result = build_scan_result(&parcel(), &sample, None);
        assert!(!result.sentinel_worthy);
        assert_eq!(result.distress_score, Some(0.0));
        assert!(result.distress_flags.is_none());
    }

    #[test]
    fn test_error_row_is_terminal() {
        let row = error_row(&parcel());
        assert_eq!(row.ndvi_category, NdviCategory::Error);
        assert!(row.distress_score.is_none());
        assert!(!row.sentinel_worthy);
        // scan_date set: the parcel will not be re-selected.
        assert!(!row.scan_date.is_empty());
    }
}
