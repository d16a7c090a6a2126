//! Pass 2.25: carrier-confirmed vacancy for the top composite leads.
//!
//! Two phases. Phase A resolves situs strings into API-shaped addresses
//! (parser first, then the 1 req/s geocoder, then the same-state mailing
//! address). Phase B fans the resolved list across one consumer per
//! credential, each pacing itself under the hourly quota. Store flushes
//! that fail divert to the journal; `--replay` lands them later without
//! re-spending quota.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::address::split_situs;
use crate::collectors::geocoder::GeocoderClient;
use crate::collectors::vacancy::VacancyClient;
use crate::evaluators::evaluate_usps_vacancy;
use crate::governor::{GovernorConfig, RateGovernor};
use crate::models::parcel::{UspsResult, VacancyParcel};
use crate::scheduler::journal::Journal;
use crate::scheduler::lock::RunLock;
use crate::scheduler::{self, CredentialConsumer, PoolConfig, Unit};

use super::{outcome_of, print_pool_summary, EngineContext, PassOutcome};

pub struct VacancyArgs {
    pub county: String,
    pub state: String,
    pub limit: Option<usize>,
    pub accounts: Vec<u32>,
    pub delay_min: f64,
    pub delay_max: f64,
    pub min_composite: f64,
    pub cache_days: i64,
    pub flush_every: usize,
    pub dry_run: bool,
    pub property_class: Option<String>,
    pub replay: Option<PathBuf>,
}

pub async fn run(ctx: &EngineContext, args: VacancyArgs) -> anyhow::Result<PassOutcome> {
    if let Some(path) = &args.replay {
        return replay_journal(ctx, path);
    }

    println!(
        "\n=== Pass 2.25: Carrier Vacancy — {}, {} ===",
        args.county, args.state
    );
    println!(
        "    Accounts: {:?} | Delay: {}-{}s | Min composite: {}{}",
        args.accounts,
        args.delay_min,
        args.delay_max,
        args.min_composite,
        if args.dry_run { " | DRY RUN" } else { "" }
    );

    println!("  Running migration...");
    ctx.store.migrate()?;

    // One live run at a time: two runs would double-spend the hourly quota.
    let _lock = if args.dry_run {
        None
    } else {
        Some(RunLock::acquire("usps_enrich")?)
    };

    println!("  Loading top leads (composite >= {})...", args.min_composite);
    let parcels = ctx.store.select_needing_usps(
        &args.county,
        Some(&args.state),
        args.limit,
        args.min_composite,
        args.cache_days,
        args.property_class.as_deref(),
    )?;
    println!("  Found {} parcels needing a vacancy check", parcels.len());
    if parcels.is_empty() {
        println!("  Nothing to check. All top leads already processed.");
        return Ok(PassOutcome::Completed);
    }
    if let (Some(first), Some(last)) = (parcels.first(), parcels.last()) {
        println!(
            "  Score range: {:?} -> {:?}",
            first.distress_composite, last.distress_composite
        );
    }

    // ── Phase A: address resolution ──
    println!("\n  Phase A: Pre-resolving {} addresses...", parcels.len());
    let geocoder = GeocoderClient::new();
    let (resolved, skipped) = resolve_addresses(&parcels, &args.state, &geocoder).await;
    println!(
        "  Pre-resolve complete: {} resolved, {} skipped",
        resolved.len(),
        skipped
    );
    if resolved.is_empty() {
        println!("  No resolvable addresses. Check situs data.");
        return Ok(PassOutcome::Completed);
    }

    // ── Phase B: paced vacancy checks ──
    let shutdown = scheduler::spawn_shutdown_listener();
    let tally = Arc::new(VacancyTally::default());
    let mut consumers = Vec::new();
    for &account in &args.accounts {
        match VacancyClient::from_env(account) {
            Ok(client) => {
                println!("  Account {account}: initialized");
                consumers.push(UspsConsumer {
                    client,
                    governor: RateGovernor::new(
                        format!("usps-{account}"),
                        GovernorConfig::new(args.delay_min, args.delay_max),
                        shutdown.clone(),
                    ),
                    tally: tally.clone(),
                });
            }
            Err(e) => println!("  Account {account}: SKIPPED — {e}"),
        }
    }
    if consumers.is_empty() {
        anyhow::bail!("no valid vacancy credentials; set USPS_CLIENT_ID / USPS_CLIENT_SECRET");
    }

    let est_hours = resolved.len() as f64 / (consumers.len() as f64 * 58.0);
    println!(
        "\n  Phase B: checking {} parcels with {} account(s), ~{est_hours:.1}h estimated",
        resolved.len(),
        consumers.len()
    );

    let store = ctx.store.clone();
    let dry_run = args.dry_run;
    let flush: Arc<dyn Fn(&[UspsResult]) -> anyhow::Result<usize> + Send + Sync> =
        Arc::new(move |rows| {
            if dry_run {
                for r in rows {
                    print_dry_row(r);
                }
                return Ok(rows.len());
            }
            store.update_batch_usps(rows)
        });

    let start = Instant::now();
    let summary = scheduler::run_credentialed(
        resolved,
        PoolConfig::new("usps_enrich", consumers.len(), args.flush_every),
        shutdown,
        consumers,
        flush,
        Journal::new(&ctx.config.journal_dir, "usps_results"),
    )
    .await;

    print_pool_summary("Vacancy Enrichment Complete", &summary, start.elapsed().as_secs_f64());
    println!("  Vacant:    {}", tally.vacant.load(Ordering::Relaxed));
    println!("  Occupied:  {}", tally.occupied.load(Ordering::Relaxed));
    println!("  Skipped:   {skipped} (no resolvable address)");
    if summary.processed > 0 {
        let vacancy_rate = tally.vacant.load(Ordering::Relaxed) as f64
            / summary.processed as f64
            * 100.0;
        println!("  Vacancy %: {vacancy_rate:.1}%");
    }
    Ok(outcome_of(&summary))
}

/// Replay a journal written during a store outage. Rows land exactly as
/// the original flush would have written them; nothing re-hits the API.
fn replay_journal(ctx: &EngineContext, path: &PathBuf) -> anyhow::Result<PassOutcome> {
    if !path.exists() {
        anyhow::bail!("journal not found: {}", path.display());
    }
    let rows: Vec<UspsResult> = Journal::read_rows(path)?;
    if rows.is_empty() {
        println!("  No records in journal.");
        return Ok(PassOutcome::Completed);
    }
    println!("  Replaying {} records from {}...", rows.len(), path.display());
    ctx.store.migrate()?;
    let written = ctx.store.update_batch_usps(&rows)?;
    let renamed = Journal::mark_replayed(path)?;
    println!("  Replayed {written} records; journal renamed to {}", renamed.display());
    Ok(PassOutcome::Completed)
}

/// A parcel with an API-ready address attached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolvedParcel {
    pub parcel: VacancyParcel,
    pub street: String,
    pub city: Option<String>,
    pub state: String,
    pub zip: Option<String>,
}

/// Phase A: parser, then geocoder, then same-state mailing fallback.
/// Single-threaded on purpose: the geocoder policy is 1 request/second.
pub(crate) async fn resolve_addresses(
    parcels: &[VacancyParcel],
    fallback_state: &str,
    geocoder: &GeocoderClient,
) -> (Vec<ResolvedParcel>, usize) {
    let mut resolved = Vec::new();
    let mut skipped = 0usize;

    for parcel in parcels {
        let Some(situs) = parcel.situs_address.as_deref().filter(|s| !s.trim().is_empty())
        else {
            skipped += 1;
            continue;
        };

        let parsed = split_situs(situs, Some(fallback_state), None);
        if parsed.street.trim().is_empty() {
            skipped += 1;
            continue;
        }
        let state = parsed
            .state
            .unwrap_or_else(|| fallback_state.to_string());
        let mut city = parsed.city;
        let mut zip = parsed.zip;

        if city.is_none() && zip.is_none() {
            let geo = geocoder
                .resolve(
                    &parsed.street,
                    &parcel.county,
                    &state,
                    parcel.latitude,
                    parcel.longitude,
                )
                .await;
            city = geo.city;
            zip = geo.zip;
        }

        // Mailing address fallback, but only when the owner mails in-state:
        // out-of-state investor addresses would validate the wrong city.
        if city.is_none() && zip.is_none() {
            let mail_state = parcel
                .mailing_state
                .as_deref()
                .unwrap_or("")
                .trim()
                .to_uppercase();
            if mail_state == state.to_uppercase() {
                city = parcel
                    .mailing_city
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                zip = parcel
                    .mailing_zip
                    .as_deref()
                    .map(|z| z.trim().chars().take(5).collect::<String>())
                    .filter(|z| !z.is_empty());
            }
        }

        if city.is_none() && zip.is_none() {
            skipped += 1;
            continue;
        }

        resolved.push(ResolvedParcel {
            parcel: parcel.clone(),
            street: parsed.street,
            city,
            state,
            zip,
        });
    }

    (resolved, skipped)
}

#[derive(Default)]
struct VacancyTally {
    vacant: AtomicU64,
    occupied: AtomicU64,
}

struct UspsConsumer {
    client: VacancyClient,
    governor: RateGovernor,
    tally: Arc<VacancyTally>,
}

#[async_trait]
impl CredentialConsumer<ResolvedParcel, UspsResult> for UspsConsumer {
    fn label(&self) -> String {
        format!("usps-{}", self.client.account)
    }

    async fn process(&mut self, item: ResolvedParcel) -> Unit<UspsResult> {
        let check = self
            .client
            .check(
                &mut self.governor,
                &item.street,
                item.city.as_deref(),
                Some(&item.state),
                item.zip.as_deref(),
            )
            .await;

        match check {
            Ok(check) => {
                match check.vacant {
                    Some(true) => self.tally.vacant.fetch_add(1, Ordering::Relaxed),
                    Some(false) => self.tally.occupied.fetch_add(1, Ordering::Relaxed),
                    None => 0,
                };
                let flag = evaluate_usps_vacancy(Some(&check));
                Unit::Row(UspsResult {
                    parcel_id: item.parcel.parcel_id.clone(),
                    county: item.parcel.county.clone(),
                    account: Some(self.client.account),
                    usps_vacant: check.vacant,
                    usps_dpv_confirmed: check.dpv_confirmed,
                    usps_address: check.usps_address.clone(),
                    usps_city: check.usps_city.clone(),
                    usps_zip: check.usps_zip.clone(),
                    usps_zip4: check.usps_zip4.clone(),
                    usps_business: check.business,
                    usps_carrier_route: check.carrier_route.clone(),
                    usps_address_mismatch: check.address_mismatch,
                    usps_error: None,
                    flag_vacancy: flag.is_some(),
                    vacancy_confidence: flag.map(|f| f.confidence),
                })
            }
            Err(e) => {
                // Error rows still flow to the store: the transient /
                // permanent split there decides retry eligibility.
                Unit::ErrorRow(UspsResult {
                    parcel_id: item.parcel.parcel_id.clone(),
                    county: item.parcel.county.clone(),
                    account: Some(self.client.account),
                    usps_vacant: None,
                    usps_dpv_confirmed: None,
                    usps_address: None,
                    usps_city: None,
                    usps_zip: None,
                    usps_zip4: None,
                    usps_business: None,
                    usps_carrier_route: None,
                    usps_address_mismatch: false,
                    usps_error: Some(e.code()),
                    flag_vacancy: false,
                    vacancy_confidence: None,
                })
            }
        }
    }
}

fn print_dry_row(r: &UspsResult) {
    let vacant_str = match r.usps_vacant {
        Some(true) => "VACANT",
        Some(false) => "occupied",
        None => "unknown",
    };
    let conf_str = r
        .vacancy_confidence
        .map(|c| format!("{c:.2}"))
        .unwrap_or_else(|| "--".to_string());
    println!(
        "  [DRY] {}  {vacant_str}  conf={conf_str}  addr={}  {}",
        r.parcel_id,
        r.usps_address.as_deref().unwrap_or("--"),
        r.usps_error.as_deref().unwrap_or(""),
    );
}
