//! Pass 2: scene-pair comparison for scanned parcels, highest distress
//! first, gated on scan recency.

use std::sync::Arc;
use std::time::Instant;

use crate::collectors::scenes::SceneClient;
use crate::error::ErrorTag;
use crate::models::parcel::{SceneParcel, SceneResult};
use crate::models::readings::ScenePair;
use crate::scheduler::{self, PoolConfig, Unit};
use crate::store::now_timestamp;

use super::{outcome_of, print_pool_summary, EngineContext, PassOutcome};

pub struct SceneArgs {
    pub county: String,
    pub limit: Option<usize>,
    pub force: bool,
}

/// A parcel scanned within this window is skipped unless forced.
const RECENCY_DAYS: i64 = 60;
const WORKERS: usize = 4;
const FLUSH_EVERY: usize = 25;

pub async fn run(ctx: &EngineContext, args: SceneArgs) -> anyhow::Result<PassOutcome> {
    println!("\n=== Pass 2: Scene Comparison — {} ===", args.county);

    println!("  Running migration...");
    ctx.store.migrate()?;

    let client = Arc::new(SceneClient::from_env(ctx.storage.clone())?);

    println!("  Loading eligible parcels...");
    let parcels =
        ctx.store
            .select_for_scenes(&args.county, args.limit, args.force, RECENCY_DAYS)?;
    println!(
        "  Found {} parcels{}",
        parcels.len(),
        if args.force { " (forced)" } else { "" }
    );
    if parcels.is_empty() {
        println!("  Nothing to compare. 0 processed.");
        return Ok(PassOutcome::Completed);
    }

    let shutdown = scheduler::spawn_shutdown_listener();
    let store = ctx.store.clone();
    let flush: Arc<dyn Fn(&[SceneResult]) -> anyhow::Result<usize> + Send + Sync> =
        Arc::new(move |rows| store.update_batch_scene(rows));

    let start = Instant::now();
    let pool_client = client.clone();
    let summary = scheduler::run_parallel(
        parcels,
        PoolConfig::new("scene_compare", WORKERS, FLUSH_EVERY),
        shutdown,
        move |parcel: SceneParcel| {
            let client = pool_client.clone();
            async move { compare_parcel(&client, parcel).await }
        },
        flush,
    )
    .await;

    println!("\n  API requests spent: {}", client.requests_made());
    print_pool_summary("Scene Comparison Complete", &summary, start.elapsed().as_secs_f64());
    Ok(outcome_of(&summary))
}

async fn compare_parcel(client: &SceneClient, parcel: SceneParcel) -> Unit<SceneResult> {
    match client.refine(parcel.latitude, parcel.longitude).await {
        Ok(pair) => Unit::Row(build_scene_result(&parcel, &pair)),
        Err(e) if e.tag() == ErrorTag::Transient => {
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "scene search transient failure");
            Unit::Error
        }
        Err(e) => {
            // Permanent: stamp the scan date with an empty pair so the
            // recency gate stops re-spending searches here.
            tracing::warn!(parcel_id = %parcel.parcel_id, error = %e, "scene search permanent failure");
            Unit::ErrorRow(build_scene_result(&parcel, &ScenePair::default()))
        }
    }
}

fn build_scene_result(parcel: &SceneParcel, pair: &ScenePair) -> SceneResult {
    SceneResult {
        parcel_id: parcel.parcel_id.clone(),
        county: parcel.county.clone(),
        planet_scene_count: pair.scene_count,
        planet_change_score: pair.change_score,
        planet_temporal_span_days: pair.temporal_span_days,
        planet_latest_date: pair.latest_date.clone(),
        planet_earliest_date: pair.earliest_date.clone(),
        planet_thumb_latest_url: pair.thumb_latest_url.clone(),
        planet_thumb_earliest_url: pair.thumb_earliest_url.clone(),
        planet_scan_date: now_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_result_carries_pair() {
        let parcel = SceneParcel {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            latitude: 35.0,
            longitude: -80.0,
            planet_scan_date: None,
        };
        let pair = ScenePair {
            scene_count: 7,
            latest_id: Some("L".into()),
            latest_date: Some("2026-07-01".into()),
            earliest_id: Some("E".into()),
            earliest_date: Some("2025-10-01".into()),
            temporal_span_days: Some(273),
            change_score: Some(0.45),
            thumb_latest_url: Some("data/a.png".into()),
            thumb_earliest_url: Some("data/b.png".into()),
        };
        let result = build_scene_result(&parcel, &pair);
        assert_eq!(result.planet_scene_count, 7);
        assert_eq!(result.planet_change_score, Some(0.45));
        assert_eq!(result.planet_temporal_span_days, Some(273));
        assert!(!result.planet_scan_date.is_empty());
    }

    #[test]
    fn test_empty_pair_still_stamps_scan_date() {
        let parcel = SceneParcel {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            latitude: 35.0,
            longitude: -80.0,
            planet_scan_date: None,
        };
        let result = build_scene_result(&parcel, &ScenePair::default());
        assert_eq!(result.planet_scene_count, 0);
        assert!(result.planet_change_score.is_none());
        assert!(!result.planet_scan_date.is_empty());
    }
}
