//! Pass scheduler: bounded worker pools over a shared work queue.
//!
//! Two shapes. Parallel-independent (aerial/slope style) spawns N workers
//! against an unthrottled upstream. Rate-limited-shared (vacancy/trend
//! style) runs one consumer per credential, each pacing itself through its
//! own governor, with a circuit breaker and an outage journal.
//!
//! Both share the buffer/flush discipline: workers append results to a
//! mutex-guarded buffer in O(1); whichever worker trips the threshold
//! drains the buffer under the lock and hands the batch to the store on a
//! fresh connection. A worker that has appended keeps pulling work while
//! someone else's flush is in flight.

pub mod checkpoint;
pub mod journal;
pub mod lock;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;

use crate::governor::interruptible_sleep;
use journal::Journal;

/// Outcome of one unit of work.
pub enum Unit<R> {
    /// Clean result.
    Row(R),
    /// A result row that still records a failure (e.g. a transient
    /// vacancy-check error that must reach the store). Counts against the
    /// circuit breaker.
    ErrorRow(R),
    /// Failed without producing a row; the eligibility predicate will
    /// re-select the parcel next run.
    Error,
    /// Eligibility not met after load (e.g. unresolvable address).
    Skip,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    pub skipped: AtomicU64,
    pub flushed: AtomicU64,
}

impl PoolStats {
    fn snapshot(&self) -> serde_json::Value {
        json!({
            "processed": self.processed.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "skipped": self.skipped.load(Ordering::Relaxed),
            "flushed": self.flushed.load(Ordering::Relaxed),
        })
    }

    fn done(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
            + self.errors.load(Ordering::Relaxed)
            + self.skipped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct PoolSummary {
    pub processed: u64,
    pub errors: u64,
    pub skipped: u64,
    pub flushed: u64,
    pub aborted: bool,
    pub journal_path: Option<std::path::PathBuf>,
}

/// What to do with a batch the store refused.
pub enum FlushFallback {
    /// Put the batch back in the buffer and retry on the next flush.
    Requeue,
    /// Append the batch to the outage journal for a later `--replay`.
    Journal(Journal),
}

pub struct PoolConfig {
    pub job_name: String,
    pub workers: usize,
    pub flush_every: usize,
    /// Circuit-breaker pause length; shortened only by tests.
    pub breaker_pause: Duration,
}

impl PoolConfig {
    pub fn new(job_name: impl Into<String>, workers: usize, flush_every: usize) -> Self {
        Self {
            job_name: job_name.into(),
            workers,
            flush_every,
            breaker_pause: BREAKER_PAUSE,
        }
    }
}

/// Consumer bound to one credential (Shape B). Owns its governor; the
/// scheduler never touches pacing state.
#[async_trait]
pub trait CredentialConsumer<W, R>: Send + 'static {
    fn label(&self) -> String;
    async fn process(&mut self, unit: W) -> Unit<R>;
}

struct FlushState<R> {
    buffer: Mutex<Vec<R>>,
    journal_path: Mutex<Option<std::path::PathBuf>>,
}

fn drain_and_flush<R: serde::Serialize>(
    state: &FlushState<R>,
    flush: &(dyn Fn(&[R]) -> anyhow::Result<usize> + Send + Sync),
    fallback: &FlushFallback,
    stats: &PoolStats,
    job_name: &str,
    run_id: &str,
    total: usize,
    account: Option<u32>,
) {
    let batch = {
        let mut buffer = state.buffer.lock().unwrap();
        if buffer.is_empty() {
            return;
        }
        std::mem::take(&mut *buffer)
    };

    match flush(&batch) {
        Ok(written) => {
            stats.flushed.fetch_add(written as u64, Ordering::Relaxed);
            checkpoint::save(job_name, run_id, total, stats.snapshot());
        }
        Err(e) => {
            tracing::error!(batch = batch.len(), "flush failed: {e}");
            match fallback {
                FlushFallback::Requeue => {
                    let mut buffer = state.buffer.lock().unwrap();
                    let mut restored = batch;
                    restored.extend(buffer.drain(..));
                    *buffer = restored;
                }
                FlushFallback::Journal(journal) => match journal.append(&batch, account) {
                    Ok(path) => {
                        stats.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        *state.journal_path.lock().unwrap() = Some(path);
                    }
                    Err(e) => {
                        tracing::error!("journal append failed, re-buffering: {e}");
                        let mut buffer = state.buffer.lock().unwrap();
                        let mut restored = batch;
                        restored.extend(buffer.drain(..));
                        *buffer = restored;
                    }
                },
            }
        }
    }
}

fn spawn_progress(
    stats: Arc<PoolStats>,
    total: usize,
    start: Instant,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        'outer: loop {
            for _ in 0..10 {
                if stop.load(Ordering::Relaxed) {
                    break 'outer;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let done = stats.done();
            let errors = stats.errors.load(Ordering::Relaxed);
            let flushed = stats.flushed.load(Ordering::Relaxed);
            let elapsed = start.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
            let remaining = total.saturating_sub(done as usize);
            let eta_min = if rate > 0.0 {
                remaining as f64 / rate / 60.0
            } else {
                0.0
            };
            let pct = if total > 0 {
                done as f64 / total as f64 * 100.0
            } else {
                100.0
            };
            eprint!(
                "\r  [{done}/{total}] {pct:.0}% | err={errors} flushed={flushed} | {rate:.1}/sec ETA {eta_min:.0}m  "
            );
        }
        eprintln!();
    })
}

fn record_unit<R>(unit: Unit<R>, stats: &PoolStats) -> Option<R> {
    match unit {
        Unit::Row(row) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
            Some(row)
        }
        Unit::ErrorRow(row) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            Some(row)
        }
        Unit::Error => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            None
        }
        Unit::Skip => {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Shape A: parallel-independent pool.
///
/// `process` is cloned into each worker; `flush` runs on whichever worker
/// trips the threshold. On shutdown workers finish their in-flight unit,
/// then the main task drains the buffer one final time.
pub async fn run_parallel<W, R, P, Fut>(
    work: Vec<W>,
    config: PoolConfig,
    shutdown: Arc<AtomicBool>,
    process: P,
    flush: Arc<dyn Fn(&[R]) -> anyhow::Result<usize> + Send + Sync>,
) -> PoolSummary
where
    W: Send + 'static,
    R: serde::Serialize + Send + 'static,
    P: Fn(W) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Unit<R>> + Send + 'static,
{
    let total = work.len();
    let run_id = uuid::Uuid::new_v4().to_string();
    let start = Instant::now();
    let stats = Arc::new(PoolStats::default());
    let state = Arc::new(FlushState {
        buffer: Mutex::new(Vec::new()),
        journal_path: Mutex::new(None),
    });
    let queue = Arc::new(Mutex::new(work.into_iter().collect::<VecDeque<W>>()));

    let progress_stop = Arc::new(AtomicBool::new(false));
    let progress = spawn_progress(stats.clone(), total, start, progress_stop.clone());

    let mut handles = Vec::new();
    for _ in 0..config.workers.max(1) {
        let queue = queue.clone();
        let stats = stats.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        let process = process.clone();
        let flush = flush.clone();
        let job_name = config.job_name.clone();
        let run_id = run_id.clone();
        let flush_every = config.flush_every;

        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(item) = queue.lock().unwrap().pop_front() else {
                    break;
                };
                let unit = process(item).await;
                if let Some(row) = record_unit(unit, &stats) {
                    let should_flush = {
                        let mut buffer = state.buffer.lock().unwrap();
                        buffer.push(row);
                        buffer.len() >= flush_every
                    };
                    if should_flush {
                        drain_and_flush(
                            &state,
                            flush.as_ref(),
                            &FlushFallback::Requeue,
                            &stats,
                            &job_name,
                            &run_id,
                            total,
                            None,
                        );
                    }
                }
            }
        }));
    }

    join_all(handles).await;
    progress_stop.store(true, Ordering::Relaxed);
    let _ = progress.await;

    // Final flush of whatever the workers left behind.
    drain_and_flush(
        &state,
        flush.as_ref(),
        &FlushFallback::Requeue,
        &stats,
        &config.job_name,
        &run_id,
        total,
        None,
    );

    checkpoint::mark_complete(
        &config.job_name,
        &run_id,
        total,
        stats.snapshot(),
        start.elapsed().as_secs_f64(),
    );

    let summary = PoolSummary {
        processed: stats.processed.load(Ordering::Relaxed),
        errors: stats.errors.load(Ordering::Relaxed),
        skipped: stats.skipped.load(Ordering::Relaxed),
        flushed: stats.flushed.load(Ordering::Relaxed),
        aborted: shutdown.load(Ordering::Relaxed),
        journal_path: state.journal_path.lock().unwrap().clone(),
    };
    summary
}

/// Consecutive errors before a consumer pauses for five minutes.
const BREAKER_PAUSE_THRESHOLD: u32 = 10;
/// Consecutive errors before the whole run aborts.
const BREAKER_ABORT_THRESHOLD: u32 = 20;
pub const BREAKER_PAUSE: Duration = Duration::from_secs(300);

/// Shape B: rate-limited-shared pool.
///
/// One consumer task per credential, pulling from the shared queue until it
/// drains or shutdown is signaled. A consumer hitting its breaker pause
/// keeps its place; hitting the abort threshold shuts the whole run down
/// (other consumers finish their in-flight unit). Failed flushes divert to
/// the journal instead of blocking the run.
pub async fn run_credentialed<W, R, C>(
    work: Vec<W>,
    config: PoolConfig,
    shutdown: Arc<AtomicBool>,
    consumers: Vec<C>,
    flush: Arc<dyn Fn(&[R]) -> anyhow::Result<usize> + Send + Sync>,
    journal: Journal,
) -> PoolSummary
where
    W: Send + 'static,
    R: serde::Serialize + Send + 'static,
    C: CredentialConsumer<W, R>,
{
    let total = work.len();
    let run_id = uuid::Uuid::new_v4().to_string();
    let start = Instant::now();
    let stats = Arc::new(PoolStats::default());
    let state = Arc::new(FlushState {
        buffer: Mutex::new(Vec::new()),
        journal_path: Mutex::new(None),
    });
    let queue = Arc::new(Mutex::new(work.into_iter().collect::<VecDeque<W>>()));
    let fallback = Arc::new(FlushFallback::Journal(journal));
    let aborted = Arc::new(AtomicBool::new(false));

    let progress_stop = Arc::new(AtomicBool::new(false));
    let progress = spawn_progress(stats.clone(), total, start, progress_stop.clone());

    let mut handles = Vec::new();
    for mut consumer in consumers {
        let queue = queue.clone();
        let stats = stats.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        let flush = flush.clone();
        let fallback = fallback.clone();
        let aborted = aborted.clone();
        let job_name = config.job_name.clone();
        let run_id = run_id.clone();
        let flush_every = config.flush_every;
        let breaker_pause = config.breaker_pause;

        handles.push(tokio::spawn(async move {
            let label = consumer.label();
            let mut consecutive_errors: u32 = 0;

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(item) = queue.lock().unwrap().pop_front() else {
                    break;
                };

                let unit = consumer.process(item).await;
                let is_error = matches!(unit, Unit::Error | Unit::ErrorRow(_));
                if let Some(row) = record_unit(unit, &stats) {
                    let should_flush = {
                        let mut buffer = state.buffer.lock().unwrap();
                        buffer.push(row);
                        buffer.len() >= flush_every
                    };
                    if should_flush {
                        drain_and_flush(
                            &state, flush.as_ref(), &fallback, &stats, &job_name, &run_id,
                            total, None,
                        );
                    }
                }

                if is_error {
                    consecutive_errors += 1;
                    if consecutive_errors >= BREAKER_ABORT_THRESHOLD {
                        tracing::error!(consumer = %label, consecutive_errors, "circuit breaker: aborting run");
                        aborted.store(true, Ordering::Relaxed);
                        shutdown.store(true, Ordering::Relaxed);
                        break;
                    }
                    if consecutive_errors == BREAKER_PAUSE_THRESHOLD {
                        tracing::warn!(consumer = %label, consecutive_errors, "circuit breaker: pausing 5 minutes");
                        interruptible_sleep(breaker_pause, &shutdown).await;
                    }
                } else {
                    consecutive_errors = 0;
                }
            }
        }));
    }

    join_all(handles).await;
    progress_stop.store(true, Ordering::Relaxed);
    let _ = progress.await;

    drain_and_flush(
        &state,
        flush.as_ref(),
        &fallback,
        &stats,
        &config.job_name,
        &run_id,
        total,
        None,
    );

    checkpoint::mark_complete(
        &config.job_name,
        &run_id,
        total,
        stats.snapshot(),
        start.elapsed().as_secs_f64(),
    );

    let summary = PoolSummary {
        processed: stats.processed.load(Ordering::Relaxed),
        errors: stats.errors.load(Ordering::Relaxed),
        skipped: stats.skipped.load(Ordering::Relaxed),
        flushed: stats.flushed.load(Ordering::Relaxed),
        aborted: aborted.load(Ordering::Relaxed),
        journal_path: state.journal_path.lock().unwrap().clone(),
    };
    summary
}

/// Listen for ctrl-c and trip the shared shutdown flag. Workers finish
/// their in-flight unit; the final flush still runs.
pub fn spawn_shutdown_listener() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  interrupt — finishing in-flight work, flushing buffer...");
            flag.store(true, Ordering::Relaxed);
        }
    });
    shutdown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, serde::Serialize)]
    struct Row {
        id: usize,
    }

    fn pool_config(workers: usize, flush_every: usize) -> PoolConfig {
        let mut config = PoolConfig::new(format!("test_{}", uuid::Uuid::new_v4()), workers, flush_every);
        config.breaker_pause = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_parallel_pool_processes_everything() {
        let flushed = Arc::new(Mutex::new(Vec::<usize>::new()));
        let sink = flushed.clone();
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(move |rows| {
                sink.lock().unwrap().extend(rows.iter().map(|r| r.id));
                Ok(rows.len())
            });

        let work: Vec<usize> = (0..57).collect();
        let summary = run_parallel(
            work,
            pool_config(4, 10),
            Arc::new(AtomicBool::new(false)),
            |id: usize| async move { Unit::Row(Row { id }) },
            flush,
        )
        .await;

        assert_eq!(summary.processed, 57);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.flushed, 57);
        assert!(!summary.aborted);

        let mut seen = flushed.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..57).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallel_pool_counts_errors_and_skips() {
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(|rows| Ok(rows.len()));
        let summary = run_parallel(
            (0..30).collect::<Vec<usize>>(),
            pool_config(3, 100),
            Arc::new(AtomicBool::new(false)),
            |id: usize| async move {
                match id % 3 {
                    0 => Unit::Row(Row { id }),
                    1 => Unit::Error,
                    _ => Unit::Skip,
                }
            },
            flush,
        )
        .await;
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.errors, 10);
        assert_eq!(summary.skipped, 10);
    }

    #[tokio::test]
    async fn test_parallel_pool_requeues_failed_flush() {
        // First flush attempt fails, later attempts succeed; nothing lost.
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();
        let written = Arc::new(AtomicU64::new(0));
        let written_sink = written.clone();
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(move |rows| {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    anyhow::bail!("store unreachable");
                }
                written_sink.fetch_add(rows.len() as u64, Ordering::Relaxed);
                Ok(rows.len())
            });

        let summary = run_parallel(
            (0..25).collect::<Vec<usize>>(),
            pool_config(1, 10),
            Arc::new(AtomicBool::new(false)),
            |id: usize| async move { Unit::Row(Row { id }) },
            flush,
        )
        .await;

        assert_eq!(summary.processed, 25);
        assert_eq!(written.load(Ordering::Relaxed), 25);
    }

    #[tokio::test]
    async fn test_parallel_pool_stops_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(|rows| Ok(rows.len()));
        let summary = run_parallel(
            (0..1000).collect::<Vec<usize>>(),
            pool_config(4, 10),
            shutdown,
            |id: usize| async move { Unit::Row(Row { id }) },
            flush,
        )
        .await;
        // Pre-set shutdown: nothing pulled.
        assert_eq!(summary.processed, 0);
        assert!(summary.aborted);
    }

    struct FlakyConsumer {
        name: String,
        fail_all: bool,
    }

    #[async_trait]
    impl CredentialConsumer<usize, Row> for FlakyConsumer {
        fn label(&self) -> String {
            self.name.clone()
        }

        async fn process(&mut self, unit: usize) -> Unit<Row> {
            if self.fail_all {
                Unit::Error
            } else {
                Unit::Row(Row { id: unit })
            }
        }
    }

    #[tokio::test]
    async fn test_credentialed_pool_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(|rows| Ok(rows.len()));
        let summary = run_credentialed(
            (0..40).collect::<Vec<usize>>(),
            pool_config(0, 15),
            Arc::new(AtomicBool::new(false)),
            vec![
                FlakyConsumer { name: "acct1".into(), fail_all: false },
                FlakyConsumer { name: "acct2".into(), fail_all: false },
            ],
            flush,
            Journal::new(dir.path(), "test"),
        )
        .await;
        assert_eq!(summary.processed, 40);
        assert_eq!(summary.flushed, 40);
        assert!(!summary.aborted);
    }

    #[tokio::test]
    async fn test_credentialed_pool_aborts_after_consecutive_errors() {
        let dir = tempfile::tempdir().unwrap();
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(|rows| Ok(rows.len()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let summary = run_credentialed(
            (0..200).collect::<Vec<usize>>(),
            pool_config(0, 50),
            shutdown.clone(),
            vec![FlakyConsumer { name: "bad".into(), fail_all: true }],
            flush,
            Journal::new(dir.path(), "test"),
        )
        .await;
        assert!(summary.aborted);
        assert!(shutdown.load(Ordering::Relaxed));
        // Aborted at the threshold, not after the whole queue.
        assert_eq!(summary.errors, BREAKER_ABORT_THRESHOLD as u64);
    }

    #[tokio::test]
    async fn test_credentialed_pool_journals_failed_flush() {
        let dir = tempfile::tempdir().unwrap();
        let flush: Arc<dyn Fn(&[Row]) -> anyhow::Result<usize> + Send + Sync> =
            Arc::new(|_| anyhow::bail!("store down"));
        let summary = run_credentialed(
            (0..5).collect::<Vec<usize>>(),
            pool_config(0, 100),
            Arc::new(AtomicBool::new(false)),
            vec![FlakyConsumer { name: "acct1".into(), fail_all: false }],
            flush,
            Journal::new(dir.path(), "test"),
        )
        .await;
        assert_eq!(summary.processed, 5);
        let path = summary.journal_path.expect("journal written");
        let rows: Vec<serde_json::Value> = Journal::read_rows(&path).unwrap();
        assert_eq!(rows.len(), 5);
    }
}
