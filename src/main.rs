use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use distress_engine::passes::{
    conviction, pass1, scene, slope, trend, vacancy, EngineContext, PassOutcome,
};

#[derive(Parser)]
#[command(
    name = "distress-engine",
    version,
    about = "Multi-pass geospatial distress enrichment over county parcel data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pass 1: aerial NDVI + flood zone over unscanned parcels
    #[command(name = "pass1")]
    Pass1(Pass1Cli),
    /// Pass 1.5: historical NDVI slope, county percentiles, composite
    #[command(name = "pass1.5-slope")]
    Slope(SlopeCli),
    /// Pass 1.75: satellite trend enrichment for sentinel-worthy parcels
    #[command(name = "pass1.75-trend")]
    Trend(TrendCli),
    /// Pass 2: scene-pair comparison for high-distress parcels
    #[command(name = "pass2-scene")]
    Scene(SceneCli),
    /// Pass 2.25: carrier-confirmed vacancy for top composite leads
    #[command(name = "pass2.25-vacancy")]
    Vacancy(VacancyCli),
    /// Pass 2.5: conviction score fusion (idempotent, re-runnable)
    #[command(name = "pass2.5-conviction")]
    Conviction(ConvictionCli),
}

#[derive(Args)]
struct Pass1Cli {
    #[arg(long)]
    county: String,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..=64))]
    workers: u16,
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u16).range(1..=10_000))]
    flush_every: u16,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    property_class: Option<String>,
}

#[derive(Args)]
struct SlopeCli {
    #[arg(long)]
    county: String,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..=64))]
    workers: u16,
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u16).range(1..=10_000))]
    flush_every: u16,
    #[arg(long)]
    dry_run: bool,
    /// Skip slope collection, recompute percentiles + composites only
    #[arg(long)]
    composite_only: bool,
    #[arg(long, default_value_t = 0.70)]
    ndvi_weight: f64,
    #[arg(long, default_value_t = 0.30)]
    fema_weight: f64,
}

#[derive(Args)]
struct TrendCli {
    #[arg(long)]
    county: String,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    /// Target parcels per minute
    #[arg(long, default_value_t = 40.0)]
    rate: f64,
    #[arg(long, default_value_t = 12, value_parser = clap::value_parser!(u8).range(1..=36))]
    months: u8,
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u16).range(1..=10_000))]
    flush_every: u16,
    /// Hard cap on primary-archive requests (budget guard)
    #[arg(long)]
    max_requests: Option<u64>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct SceneCli {
    #[arg(long)]
    county: String,
    #[arg(long)]
    limit: Option<usize>,
    /// Ignore the 60-day scan recency gate
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct VacancyCli {
    #[arg(long)]
    county: String,
    #[arg(long, default_value = "NC")]
    state: String,
    #[arg(long, default_value_t = 500)]
    limit: usize,
    /// Comma-separated credential account numbers
    #[arg(long, default_value = "1,3")]
    accounts: String,
    #[arg(long, default_value_t = 55, value_parser = clap::value_parser!(u16).range(0..=600))]
    delay_min: u16,
    #[arg(long, default_value_t = 65, value_parser = clap::value_parser!(u16).range(0..=600))]
    delay_max: u16,
    #[arg(long, default_value_t = 7.0)]
    min_composite: f64,
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u16).range(0..=365))]
    cache_days: u16,
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(1..=10_000))]
    flush_every: u16,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    property_class: Option<String>,
    /// Replay a journal file into the store (after outage recovery)
    #[arg(long)]
    replay: Option<std::path::PathBuf>,
}

#[derive(Args)]
struct ConvictionCli {
    #[arg(long)]
    county: String,
    #[arg(long)]
    state: String,
    #[arg(long)]
    dry_run: bool,
    /// Treat motivation signals as absent
    #[arg(long)]
    skip_motivation: bool,
}

const EXIT_OK: i32 = 0;
const EXIT_ARG_ERROR: i32 = 1;
const EXIT_ABORTED: i32 = 2;

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("distress_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_ARG_ERROR,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = validate_cli(&cli) {
        eprintln!("error: {e}");
        std::process::exit(EXIT_ARG_ERROR);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(EXIT_ABORTED);
        }
    };

    let outcome = runtime.block_on(dispatch(cli));
    match outcome {
        Ok(PassOutcome::Completed) => std::process::exit(EXIT_OK),
        Ok(PassOutcome::Aborted) => std::process::exit(EXIT_ABORTED),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(EXIT_ABORTED);
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<PassOutcome> {
    let ctx = EngineContext::init()?;
    match cli.command {
        Commands::Pass1(args) => {
            pass1::run(
                &ctx,
                pass1::Pass1Args {
                    county: args.county,
                    state: args.state,
                    limit: args.limit,
                    workers: args.workers as usize,
                    flush_every: args.flush_every as usize,
                    dry_run: args.dry_run,
                    property_class: args.property_class,
                },
            )
            .await
        }
        Commands::Slope(args) => {
            slope::run(
                &ctx,
                slope::SlopeArgs {
                    county: args.county,
                    state: args.state,
                    limit: args.limit,
                    workers: args.workers as usize,
                    flush_every: args.flush_every as usize,
                    dry_run: args.dry_run,
                    composite_only: args.composite_only,
                    ndvi_weight: args.ndvi_weight,
                    fema_weight: args.fema_weight,
                },
            )
            .await
        }
        Commands::Trend(args) => {
            trend::run(
                &ctx,
                trend::TrendArgs {
                    county: args.county,
                    state: args.state,
                    limit: args.limit,
                    rate_per_minute: args.rate,
                    months: args.months as u32,
                    flush_every: args.flush_every as usize,
                    max_requests: args.max_requests,
                    dry_run: args.dry_run,
                },
            )
            .await
        }
        Commands::Scene(args) => {
            scene::run(
                &ctx,
                scene::SceneArgs {
                    county: args.county,
                    limit: args.limit,
                    force: args.force,
                },
            )
            .await
        }
        Commands::Vacancy(args) => {
            let accounts = parse_accounts(&args.accounts)?;
            vacancy::run(
                &ctx,
                vacancy::VacancyArgs {
                    county: args.county,
                    state: args.state,
                    limit: Some(args.limit),
                    accounts,
                    delay_min: args.delay_min as f64,
                    delay_max: args.delay_max as f64,
                    min_composite: args.min_composite,
                    cache_days: args.cache_days as i64,
                    flush_every: args.flush_every as usize,
                    dry_run: args.dry_run,
                    property_class: args.property_class,
                    replay: args.replay,
                },
            )
            .await
        }
        Commands::Conviction(args) => {
            conviction::run(
                &ctx,
                conviction::ConvictionArgs {
                    county: args.county,
                    state: args.state,
                    dry_run: args.dry_run,
                    skip_motivation: args.skip_motivation,
                },
            )
            .await
        }
    }
}

/// Range checks clap's value parsers cannot express. Failing here is an
/// argument error (exit 1), not an aborted run.
fn validate_cli(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Slope(args) => {
            if !(0.0..=1.0).contains(&args.ndvi_weight) || !(0.0..=1.0).contains(&args.fema_weight) {
                anyhow::bail!("composite weights must be within [0, 1]");
            }
        }
        Commands::Trend(args) => {
            if args.rate <= 0.0 || args.rate > 600.0 {
                anyhow::bail!("--rate must be within (0, 600]");
            }
        }
        Commands::Vacancy(args) => {
            parse_accounts(&args.accounts)?;
            if args.delay_min > args.delay_max {
                anyhow::bail!("--delay-min must not exceed --delay-max");
            }
            if !(0.0..=10.0).contains(&args.min_composite) {
                anyhow::bail!("--min-composite must be within [0, 10]");
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_accounts(raw: &str) -> anyhow::Result<Vec<u32>> {
    let accounts: Result<Vec<u32>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect();
    let accounts = accounts.map_err(|_| anyhow::anyhow!("--accounts expects e.g. \"1,3\""))?;
    if accounts.is_empty() {
        anyhow::bail!("--accounts must name at least one credential");
    }
    Ok(accounts)
}
