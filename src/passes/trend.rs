//! Pass 1.75: satellite trend enrichment for sentinel-worthy parcels.
//!
//! Primary archive requests are quota-billed, so the pass runs as a single
//! paced consumer with an optional hard request budget. When the primary
//! archive errors or returns an empty series, the free fallback archive
//! answers instead. Flags are re-scored with the trend series folded in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::collectors::trends::{FallbackTrendClient, PrimaryTrendClient};
use crate::evaluators::{generate_all_flags, AerialInput, FlagRollup};
use crate::governor::{GovernorConfig, RateGovernor};
use crate::models::parcel::{FemaRisk, TrendParcel, TrendResult};
use crate::models::readings::{FloodZone, TrendSeries};
use crate::scheduler::journal::Journal;
use crate::scheduler::lock::RunLock;
use crate::scheduler::{self, CredentialConsumer, PoolConfig, Unit};
use crate::store::now_timestamp;

use super::{outcome_of, print_pool_summary, EngineContext, PassOutcome};

pub struct TrendArgs {
    pub county: String,
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub rate_per_minute: f64,
    pub months: u32,
    pub flush_every: usize,
    pub max_requests: Option<u64>,
    pub dry_run: bool,
}

pub async fn run(ctx: &EngineContext, args: TrendArgs) -> anyhow::Result<PassOutcome> {
    println!("\n=== Pass 1.75: Trend Enrichment — {} ===", args.county);
    println!(
        "    Rate: {}/min | Months: {} | Flush every: {}{}",
        args.rate_per_minute,
        args.months,
        args.flush_every,
        if args.dry_run { " | DRY RUN" } else { "" }
    );
    if let Some(cap) = args.max_requests {
        println!("    Primary request budget: {cap}");
    }

    println!("  Running migration...");
    ctx.store.migrate()?;

    println!("  Loading sentinel-worthy parcels...");
    let parcels = ctx.store.select_sentinel_worthy(
        &args.county,
        args.state.as_deref(),
        args.limit,
    )?;
    println!("  Found {} parcels to enrich", parcels.len());
    if parcels.is_empty() {
        println!("  Nothing to enrich. 0 processed.");
        return Ok(PassOutcome::Completed);
    }

    // Shared-quota pass: one live run at a time.
    let _lock = if args.dry_run {
        None
    } else {
        Some(RunLock::acquire("trend_enrich")?)
    };

    let primary = match PrimaryTrendClient::from_env() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            println!("  Primary archive unavailable ({e}); fallback only");
            None
        }
    };

    let shutdown = scheduler::spawn_shutdown_listener();
    let consumer = TrendConsumer {
        primary: primary.clone(),
        fallback: FallbackTrendClient::new(),
        governor: RateGovernor::new(
            "trend",
            GovernorConfig::per_minute(args.rate_per_minute),
            shutdown.clone(),
        ),
        months: args.months,
        max_requests: args.max_requests,
        budget_spent: Arc::new(AtomicBool::new(false)),
    };

    let store = ctx.store.clone();
    let dry_run = args.dry_run;
    let flush: Arc<dyn Fn(&[TrendResult]) -> anyhow::Result<usize> + Send + Sync> =
        Arc::new(move |rows| {
            if dry_run {
                for r in rows {
                    let slope_str = r
                        .sentinel_trend_slope
                        .map(|s| format!("{s:.4}"))
                        .unwrap_or_else(|| "NULL".to_string());
                    println!(
                        "  [DRY] {} trend={} slope={slope_str} src={} score={}",
                        r.parcel_id,
                        r.sentinel_trend_direction.as_str(),
                        r.sentinel_data_source.map(|s| s.as_str()).unwrap_or("--"),
                        r.distress_score
                            .map(|s| format!("{s:.1}"))
                            .unwrap_or_else(|| "--".to_string()),
                    );
                }
                return Ok(rows.len());
            }
            store.update_batch_trend(rows)
        });

    let start = Instant::now();
    let summary = scheduler::run_credentialed(
        parcels,
        PoolConfig::new("trend_enrich", 1, args.flush_every),
        shutdown,
        vec![consumer],
        flush,
        Journal::new(&ctx.config.journal_dir, "trend_results"),
    )
    .await;

    if let Some(primary) = &primary {
        println!("\n  Primary archive requests spent: {}", primary.requests_made());
    }
    print_pool_summary("Trend Enrichment Complete", &summary, start.elapsed().as_secs_f64());
    Ok(outcome_of(&summary))
}

struct TrendConsumer {
    primary: Option<Arc<PrimaryTrendClient>>,
    fallback: FallbackTrendClient,
    governor: RateGovernor,
    months: u32,
    max_requests: Option<u64>,
    budget_spent: Arc<AtomicBool>,
}

impl TrendConsumer {
    fn budget_left(&self) -> bool {
        match (&self.primary, self.max_requests) {
            (Some(primary), Some(cap)) => primary.requests_made() < cap,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[async_trait]
impl CredentialConsumer<TrendParcel, TrendResult> for TrendConsumer {
    fn label(&self) -> String {
        "trend".to_string()
    }

    async fn process(&mut self, parcel: TrendParcel) -> Unit<TrendResult> {
        let mut series: Option<TrendSeries> = None;

        if self.budget_left() {
            let primary = self.primary.as_ref().unwrap().clone();
            self.governor.acquire().await;
            self.governor.mark_request();
            match primary
                .monthly_ndvi(parcel.latitude, parcel.longitude, self.months)
                .await
            {
                Ok(s) if s.months_with_data > 0 => {
                    self.governor.record_success();
                    series = Some(s);
                }
                Ok(_) => {
                    self.governor.record_success();
                    tracing::debug!(parcel_id = %parcel.parcel_id, "primary archive empty, trying fallback");
                }
                Err(crate::error::CollectorError::RateLimited { retry_after }) => {
                    self.governor.backoff(retry_after).await;
                }
                Err(e) => {
                    tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "primary archive failed");
                }
            }
        } else if self.primary.is_some() && !self.budget_spent.swap(true, Ordering::Relaxed) {
            println!("\n  Primary request budget exhausted; continuing on fallback");
        }

        if series.is_none() {
            match self
                .fallback
                .monthly_ndvi(parcel.latitude, parcel.longitude, self.months)
                .await
            {
                Ok(s) if s.months_with_data > 0 => series = Some(s),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "fallback archive failed");
                    return Unit::Error;
                }
            }
        }

        Unit::Row(build_trend_result(&parcel, series))
    }
}

pub(crate) fn build_trend_result(
    parcel: &TrendParcel,
    series: Option<TrendSeries>,
) -> TrendResult {
    // Re-run the evaluators with the trend series alongside the pass-1
    // aerial sample and flood zone already on the row.
    let aerial_input = AerialInput {
        current_ndvi: parcel.ndvi_current,
        historical_mean: None,
    };
    let flood = parcel.fema_zone.as_ref().map(|zone| FloodZone {
        zone: Some(zone.clone()),
        is_sfha: parcel.fema_sfha,
        risk: parcel
            .fema_risk
            .as_deref()
            .map(FemaRisk::parse)
            .unwrap_or(FemaRisk::Unknown),
        zone_subtype: None,
        map_url: None,
    });

    let flags = generate_all_flags(
        Some(&aerial_input),
        series.as_ref(),
        flood.as_ref(),
        None,
    );
    let rollup = FlagRollup::from_flags(&flags);

    match series {
        Some(series) => TrendResult {
            parcel_id: parcel.parcel_id.clone(),
            county: parcel.county.clone(),
            sentinel_trend_direction: series.direction,
            sentinel_trend_slope: series.slope,
            sentinel_latest_ndvi: series.latest_ndvi,
            sentinel_months_data: series.months_with_data as i64,
            sentinel_mean_ndvi: series.mean_ndvi,
            sentinel_data_source: Some(series.source),
            sentinel_chart_url: None,
            sentinel_scan_date: now_timestamp(),
            distress_score: Some(rollup.distress_score),
            distress_flags: rollup.distress_flags,
            flag_veg_overgrowth: rollup.flag_veg_overgrowth,
            flag_veg_neglect: rollup.flag_veg_neglect,
            flag_flood: rollup.flag_flood,
            flag_structural: rollup.flag_structural,
            veg_confidence: rollup.veg_confidence,
            flood_confidence: rollup.flood_confidence,
            scan_pass: 2.0,
        },
        None => TrendResult {
            parcel_id: parcel.parcel_id.clone(),
            county: parcel.county.clone(),
            sentinel_trend_direction: crate::models::parcel::TrendDirection::InsufficientData,
            sentinel_trend_slope: None,
            sentinel_latest_ndvi: None,
            sentinel_months_data: 0,
            sentinel_mean_ndvi: None,
            sentinel_data_source: None,
            sentinel_chart_url: None,
            sentinel_scan_date: now_timestamp(),
            distress_score: Some(rollup.distress_score),
            distress_flags: rollup.distress_flags,
            flag_veg_overgrowth: rollup.flag_veg_overgrowth,
            flag_veg_neglect: rollup.flag_veg_neglect,
            flag_flood: rollup.flag_flood,
            flag_structural: rollup.flag_structural,
            veg_confidence: rollup.veg_confidence,
            flood_confidence: rollup.flood_confidence,
            scan_pass: 2.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parcel::{TrendDirection, TrendSource};
    use crate::models::readings::MonthlyNdvi;

    fn parcel(ndvi: Option<f64>) -> TrendParcel {
        TrendParcel {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            latitude: 35.2271,
            longitude: -80.8431,
            ndvi_current: ndvi,
            fema_zone: Some("X".into()),
            fema_risk: Some("low".into()),
            fema_sfha: false,
            distress_score: Some(1.0),
        }
    }

    fn increasing_series() -> TrendSeries {
        let monthly: Vec<MonthlyNdvi> = (0..10)
            .map(|i| MonthlyNdvi {
                month: format!("2025-{:02}", i + 1),
                mean: Some(0.40 + 0.03 * i as f64),
                std: None,
                cloud_pct: None,
            })
            .collect();
        crate::collectors::trends::build_series(monthly, TrendSource::Primary)
    }

    #[test]
    fn test_trend_result_rescores_flags() {
        // Increasing trend ending above 0.50 fires overgrowth on the trend
        // path even though the aerial NDVI alone would not.
        let result = build_trend_result(&parcel(Some(0.45)), Some(increasing_series()));
        assert_eq!(result.sentinel_trend_direction, TrendDirection::Increasing);
        assert!(result.flag_veg_overgrowth);
        assert!(result.distress_score.unwrap() > 0.0);
        assert_eq!(result.scan_pass, 2.0);
        assert_eq!(result.sentinel_data_source, Some(TrendSource::Primary));
        assert_eq!(result.sentinel_months_data, 10);
    }

    #[test]
    fn test_trend_result_without_series_marks_insufficient() {
        let result = build_trend_result(&parcel(Some(0.23)), None);
        assert_eq!(
            result.sentinel_trend_direction,
            TrendDirection::InsufficientData
        );
        assert!(result.sentinel_data_source.is_none());
        assert_eq!(result.sentinel_months_data, 0);
        // Pass-1 flags still re-derive from the aerial sample.
        assert!(result.flag_veg_neglect);
        // Scan date is stamped either way: the parcel leaves the queue.
        assert!(!result.sentinel_scan_date.is_empty());
    }
}
