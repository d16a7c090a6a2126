//! Pass 1.5: historical NDVI slope, then county percentiles and the
//! distress composite.

use std::sync::Arc;
use std::time::Instant;

use crate::collectors::historical::{HistoricalClient, HISTORICAL_YEARS};
use crate::error::ErrorTag;
use crate::models::parcel::{SlopeParcel, SlopeResult};
use crate::models::readings::YearNdvi;
use crate::scheduler::{self, PoolConfig, Unit};
use crate::scoring;

use super::{outcome_of, parse_year, print_pool_summary, EngineContext, PassOutcome};

pub struct SlopeArgs {
    pub county: String,
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub workers: usize,
    pub flush_every: usize,
    pub dry_run: bool,
    pub composite_only: bool,
    pub ndvi_weight: f64,
    pub fema_weight: f64,
}

pub async fn run(ctx: &EngineContext, args: SlopeArgs) -> anyhow::Result<PassOutcome> {
    println!(
        "\n=== Pass 1.5: Historical Slope + Composite — {} ===",
        args.county
    );

    println!("  Running migration...");
    ctx.store.migrate()?;

    if args.composite_only {
        recompute_derived(ctx, &args.county, args.ndvi_weight, args.fema_weight)?;
        return Ok(PassOutcome::Completed);
    }

    println!("  Loading parcels needing slope computation...");
    let parcels = ctx
        .store
        .select_needing_slope(&args.county, args.state.as_deref(), args.limit)?;
    println!("  Found {} parcels needing slope", parcels.len());

    if parcels.is_empty() {
        println!("  No parcels need slope computation.");
        if !args.dry_run {
            recompute_derived(ctx, &args.county, args.ndvi_weight, args.fema_weight)?;
        }
        return Ok(PassOutcome::Completed);
    }

    let est_calls = parcels.len() * (HISTORICAL_YEARS.len() + 1);
    println!(
        "  ~{est_calls} archive reads estimated | Workers: {} | Flush every: {}{}",
        args.workers,
        args.flush_every,
        if args.dry_run { " | DRY RUN" } else { "" }
    );

    let historical = Arc::new(HistoricalClient::new(ctx.config.cache_subdir("aerial_history")));
    let shutdown = scheduler::spawn_shutdown_listener();

    let store = ctx.store.clone();
    let dry_run = args.dry_run;
    let flush: Arc<dyn Fn(&[SlopeResult]) -> anyhow::Result<usize> + Send + Sync> =
        Arc::new(move |rows| {
            if dry_run {
                for r in rows {
                    let slope_str = r
                        .ndvi_slope_per_year
                        .map(|s| format!("{s:.6}"))
                        .unwrap_or_else(|| "NULL".to_string());
                    println!(
                        "  [DRY] {} slope={slope_str} pts={} years=[{}]",
                        r.parcel_id,
                        r.ndvi_history_count,
                        r.ndvi_history_years.as_deref().unwrap_or("--"),
                    );
                }
                return Ok(rows.len());
            }
            store.update_batch_slope(rows)
        });

    let start = Instant::now();
    let summary = scheduler::run_parallel(
        parcels,
        PoolConfig::new("slope_scan", args.workers, args.flush_every),
        shutdown.clone(),
        move |parcel: SlopeParcel| {
            let historical = historical.clone();
            async move { slope_for_parcel(&historical, parcel).await }
        },
        flush,
    )
    .await;

    print_pool_summary(
        "Slope Computation Complete",
        &summary,
        start.elapsed().as_secs_f64(),
    );

    let aborted = summary.aborted;
    if !args.dry_run && !aborted {
        recompute_derived(ctx, &args.county, args.ndvi_weight, args.fema_weight)?;
    }
    Ok(outcome_of(&summary))
}

async fn slope_for_parcel(
    historical: &HistoricalClient,
    parcel: SlopeParcel,
) -> Unit<SlopeResult> {
    let history = match historical
        .ndvi_history(parcel.latitude, parcel.longitude, HISTORICAL_YEARS)
        .await
    {
        Ok(history) => history,
        Err(e) if e.tag() == ErrorTag::Transient => {
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "history transient failure");
            return Unit::Error;
        }
        Err(e) => {
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "history permanent failure");
            Vec::new()
        }
    };

    Unit::Row(build_slope_result(&parcel, &history))
}

pub(crate) fn build_slope_result(parcel: &SlopeParcel, history: &[YearNdvi]) -> SlopeResult {
    let mut points: Vec<(f64, f64)> = history
        .iter()
        .map(|h| (h.year as f64, h.ndvi))
        .collect();
    let mut years: Vec<i32> = history.iter().map(|h| h.year).collect();

    // Fold the pass-1 sample in as one more observation, unless that
    // vintage year is already covered.
    if let (Some(ndvi), Some(date)) = (parcel.ndvi_current, parcel.ndvi_date.as_deref()) {
        if let Some(year) = parse_year(date) {
            if !years.contains(&year) {
                points.push((year as f64, ndvi));
                years.push(year);
            }
        }
    }

    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    years.sort_unstable();

    let slope = scoring::ndvi_slope(&points);
    SlopeResult {
        parcel_id: parcel.parcel_id.clone(),
        county: parcel.county.clone(),
        ndvi_slope_per_year: slope,
        ndvi_history_count: points.len() as i64,
        ndvi_history_years: if years.is_empty() {
            None
        } else {
            Some(
                years
                    .iter()
                    .map(|y| y.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        },
    }
}

/// Percentile ranks within the county, then the weighted composite.
/// Re-runnable at any time over whatever slopes have accumulated.
pub fn recompute_derived(
    ctx: &EngineContext,
    county: &str,
    ndvi_weight: f64,
    fema_weight: f64,
) -> anyhow::Result<()> {
    println!("\n  Computing composite scores (NDVI={ndvi_weight}, FEMA={fema_weight})...");

    let slopes = ctx.store.select_slopes(county)?;
    let ranks = scoring::percentile_ranks(&slopes);
    let ranked = ctx.store.update_batch_pctile(county, &ranks)?;
    println!("  Percentiles set: {ranked}");

    let inputs = ctx.store.select_composite_inputs(county)?;
    let composites: Vec<(String, f64)> = inputs
        .iter()
        .filter_map(|input| {
            scoring::distress_composite(
                input.slope_pctile,
                input.fema_risk.as_deref(),
                input.fema_sfha,
                input.has_fema,
                ndvi_weight,
                fema_weight,
            )
            .map(|c| (input.parcel_id.clone(), c))
        })
        .collect();
    let updated = ctx.store.update_batch_composite(county, &composites)?;
    println!("  Composites set: {updated}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parcel(ndvi: Option<f64>, date: Option<&str>) -> SlopeParcel {
        SlopeParcel {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            latitude: 35.2271,
            longitude: -80.8431,
            ndvi_current: ndvi,
            ndvi_date: date.map(str::to_string),
        }
    }

    fn year(year: i32, ndvi: f64) -> YearNdvi {
        YearNdvi {
            year,
            ndvi,
            date: format!("{year}-06-01"),
        }
    }

    #[test]
    fn test_slope_from_history_scenario() {
        // 2014..2022 increasing history: slope ~ +0.026/yr.
        let history = vec![
            year(2014, 0.30),
            year(2016, 0.33),
            year(2018, 0.38),
            year(2020, 0.45),
            year(2022, 0.50),
        ];
        let result = build_slope_result(&parcel(None, None), &history);
        let slope = result.ndvi_slope_per_year.unwrap();
        assert!((slope - 0.026).abs() < 0.001, "slope {slope}");
        assert_eq!(result.ndvi_history_count, 5);
        assert_eq!(
            result.ndvi_history_years.as_deref(),
            Some("2014,2016,2018,2020,2022")
        );
    }

    #[test]
    fn test_current_sample_joins_regression() {
        let history = vec![year(2018, 0.40), year(2020, 0.44)];
        let result = build_slope_result(&parcel(Some(0.48), Some("2023-05-01")), &history);
        assert_eq!(result.ndvi_history_count, 3);
        assert_eq!(result.ndvi_history_years.as_deref(), Some("2018,2020,2023"));
    }

    #[test]
    fn test_current_sample_does_not_duplicate_year() {
        let history = vec![year(2020, 0.40), year(2022, 0.44)];
        let result = build_slope_result(&parcel(Some(0.50), Some("2022-06-15")), &history);
        assert_eq!(result.ndvi_history_count, 2);
    }

    #[test]
    fn test_zero_history_slope_is_null_not_nan() {
        let result = build_slope_result(&parcel(None, None), &[]);
        assert!(result.ndvi_slope_per_year.is_none());
        assert_eq!(result.ndvi_history_count, 0);
        assert!(result.ndvi_history_years.is_none());
    }

    #[test]
    fn test_single_point_slope_is_null() {
        let result = build_slope_result(&parcel(Some(0.4), Some("2022-06-15")), &[]);
        assert!(result.ndvi_slope_per_year.is_none());
        assert_eq!(result.ndvi_history_count, 1);
    }
}
