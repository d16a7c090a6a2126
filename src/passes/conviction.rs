//! Pass 2.5: conviction fusion over everything the earlier passes
//! accumulated. Pure aggregation, idempotent, safe to re-run any time.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::models::parcel::{ConvictionParcel, ConvictionResult};
use crate::scoring::{self, MC_CAP, MODEL_VERSION, VAC_BONUS_MAX, W_DS, W_MC};

use super::{EngineContext, PassOutcome};

pub struct ConvictionArgs {
    pub county: String,
    pub state: String,
    pub dry_run: bool,
    pub skip_motivation: bool,
}

pub async fn run(ctx: &EngineContext, args: ConvictionArgs) -> anyhow::Result<PassOutcome> {
    println!(
        "\n=== Pass 2.5: Conviction Fusion — {}, {} ===",
        args.county, args.state
    );
    println!(
        "    Model: {MODEL_VERSION} | W_DS={W_DS} W_MC={W_MC} MC_CAP={MC_CAP} VAC_BONUS={VAC_BONUS_MAX}"
    );
    let start = Instant::now();

    println!("  Running migration...");
    ctx.store.migrate()?;

    println!("  Loading parcels + motivation aggregates...");
    let parcels = ctx.store.select_conviction_inputs(
        &args.county,
        &args.state,
        !args.skip_motivation,
    )?;
    println!("  Loaded {} parcels", parcels.len());
    if parcels.is_empty() {
        println!("  Nothing to fuse. 0 processed.");
        return Ok(PassOutcome::Completed);
    }

    let ds_count = parcels.iter().filter(|p| p.distress_composite.is_some()).count();
    let mc_count = parcels.iter().filter(|p| p.mc_count > 0).count();
    let vac_count = parcels.iter().filter(|p| p.flag_vacancy).count();
    println!("  Coverage: {ds_count} DS | {mc_count} MC | {vac_count} vacancy-flagged");

    let results: Vec<ConvictionResult> = parcels
        .iter()
        .map(|p| fuse_parcel(p, &args.county))
        .collect();

    let scored = results.iter().filter(|r| r.conviction_score.is_some()).count();
    let scores: Vec<f64> = results.iter().filter_map(|r| r.conviction_score).collect();
    if !scores.is_empty() {
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        let max = scores.iter().cloned().fold(f64::MIN, f64::max);
        let min = scores.iter().cloned().fold(f64::MAX, f64::min);
        println!(
            "  Scored: {scored}/{} (avg={avg:.2}, min={min:.2}, max={max:.2})",
            results.len()
        );
    }

    // Component distribution: which evidence combinations drive the list.
    let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
    for r in &results {
        let key = r
            .conviction_components
            .clone()
            .unwrap_or_else(|| "NULL".to_string());
        *distribution.entry(key).or_default() += 1;
    }
    println!("  Component distribution:");
    let mut sorted: Vec<_> = distribution.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1));
    for (components, count) in sorted {
        println!("    {components:<12} {count:>6} parcels");
    }

    if args.dry_run {
        println!("\n  [DRY RUN] — no writes performed");
        let mut top: Vec<&ConvictionResult> = results.iter().collect();
        top.sort_by(|a, b| {
            b.conviction_score
                .unwrap_or(0.0)
                .partial_cmp(&a.conviction_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for r in top.iter().take(10) {
            println!(
                "    {:<15} score={:?} base={:?} vac_bonus={} components={}",
                r.parcel_id,
                r.conviction_score,
                r.conviction_base_score,
                r.conviction_vacancy_bonus,
                r.conviction_components.as_deref().unwrap_or("--"),
            );
        }
        return Ok(PassOutcome::Completed);
    }

    println!("  Writing conviction scores...");
    let written = ctx.store.update_batch_conviction(&results)?;

    println!("\n=== Conviction Fusion Complete ===");
    println!("  Parcels:  {}", parcels.len());
    println!("  Scored:   {scored}");
    println!("  Written:  {written}");
    println!("  Time:     {:.1}s", start.elapsed().as_secs_f64());
    println!("  Model:    {MODEL_VERSION}");
    Ok(PassOutcome::Completed)
}

pub(crate) fn fuse_parcel(p: &ConvictionParcel, county: &str) -> ConvictionResult {
    let fused = scoring::conviction(
        p.distress_composite,
        p.mc_raw,
        p.mc_count,
        p.flag_vacancy,
        p.vacancy_confidence,
        p.usps_error.is_some(),
    );

    ConvictionResult {
        parcel_id: p.parcel_id.clone(),
        county: county.to_string(),
        conviction_score: fused.score,
        conviction_base_score: fused.base_score,
        conviction_vacancy_bonus: fused.vacancy_bonus,
        conviction_mc_score: if p.mc_count > 0 { Some(p.mc_raw) } else { None },
        conviction_mc_signals: if p.mc_count > 0 { Some(p.mc_count) } else { None },
        conviction_mc_codes: p.mc_codes.clone(),
        conviction_components: if fused.components.is_empty() {
            None
        } else {
            Some(fused.components.join(","))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(
        ds: Option<f64>,
        mc_raw: f64,
        mc_count: i64,
        vacancy: bool,
        vac_conf: Option<f64>,
        usps_error: Option<&str>,
    ) -> ConvictionParcel {
        ConvictionParcel {
            parcel_id: "P".into(),
            distress_composite: ds,
            flag_vacancy: vacancy,
            vacancy_confidence: vac_conf,
            usps_error: usps_error.map(str::to_string),
            mc_raw,
            mc_count,
            mc_codes: None,
        }
    }

    fn fuse_parcel_for_test(p: &ConvictionParcel) -> ConvictionResult {
        fuse_parcel(p, "CtyA")
    }

    #[test]
    fn test_fuse_ds_only() {
        let r = fuse_parcel_for_test(&input(Some(6.0), 0.0, 0, false, None, None));
        assert_eq!(r.conviction_score, Some(6.00));
        assert_eq!(r.conviction_base_score, Some(6.00));
        assert_eq!(r.conviction_vacancy_bonus, 0.0);
        assert_eq!(r.conviction_components.as_deref(), Some("DS"));
        assert!(r.conviction_mc_score.is_none());
        assert!(r.conviction_mc_signals.is_none());
    }

    #[test]
    fn test_fuse_mc_only_with_vacancy() {
        let r = fuse_parcel_for_test(&input(None, 4.2, 3, true, Some(0.9), None));
        assert_eq!(r.conviction_score, Some(8.25));
        assert_eq!(r.conviction_base_score, Some(6.00));
        assert_eq!(r.conviction_vacancy_bonus, 2.25);
        assert_eq!(r.conviction_components.as_deref(), Some("MC,VAC"));
        assert_eq!(r.conviction_mc_score, Some(4.2));
        assert_eq!(r.conviction_mc_signals, Some(3));
    }

    #[test]
    fn test_fuse_nothing_is_null() {
        let r = fuse_parcel_for_test(&input(None, 0.0, 0, false, None, None));
        assert!(r.conviction_score.is_none());
        assert!(r.conviction_components.is_none());
    }

    #[test]
    fn test_fuse_usps_error_suppresses_bonus() {
        let r = fuse_parcel_for_test(&input(Some(5.0), 0.0, 0, true, Some(0.9), Some("rate_limited")));
        assert_eq!(r.conviction_vacancy_bonus, 0.0);
        assert_eq!(r.conviction_components.as_deref(), Some("DS"));
    }
}
