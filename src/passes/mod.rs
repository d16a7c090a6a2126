//! Pass entry points: wire the store, collectors, governor, scheduler, and
//! scoring together, one pass per CLI subcommand.
//!
//! Every pass follows the same startup sequence: migrate, select the
//! eligible set, schedule, summarize. Because the selectors exclude
//! already-completed parcels, re-invoking a pass after a crash or interrupt
//! resumes where it left off.

pub mod conviction;
pub mod pass1;
pub mod scene;
pub mod slope;
pub mod trend;
pub mod vacancy;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::scheduler::PoolSummary;
use crate::storage::{LocalDirStore, ObjectStore};
use crate::store::ParcelStore;

/// How a pass ended, mapped to the process exit code by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Aborted,
}

pub struct EngineContext {
    pub store: Arc<ParcelStore>,
    pub config: EngineConfig,
    pub storage: Arc<dyn ObjectStore>,
}

impl EngineContext {
    pub fn init() -> anyhow::Result<Self> {
        let config = EngineConfig::load()?;
        let store = Arc::new(ParcelStore::new(&config.database_path));
        let storage: Arc<dyn ObjectStore> = Arc::new(LocalDirStore::new(&config.storage_dir));
        Ok(Self {
            store,
            config,
            storage,
        })
    }
}

pub(crate) fn print_pool_summary(title: &str, summary: &PoolSummary, elapsed_secs: f64) {
    println!("\n\n=== {title} ===");
    println!("  Processed: {}", summary.processed);
    println!("  Errors:    {}", summary.errors);
    if summary.skipped > 0 {
        println!("  Skipped:   {}", summary.skipped);
    }
    println!("  Written:   {}", summary.flushed);
    println!("  Time:      {elapsed_secs:.0}s ({:.1}m)", elapsed_secs / 60.0);
    if summary.processed > 0 && elapsed_secs > 0.0 {
        println!(
            "  Rate:      {:.1} parcels/sec",
            summary.processed as f64 / elapsed_secs
        );
    }
    if let Some(path) = &summary.journal_path {
        println!("  Journal:   {} (replay after store recovery)", path.display());
    }
    if summary.aborted {
        println!("  Status:    ABORTED");
    }
}

pub(crate) fn outcome_of(summary: &PoolSummary) -> PassOutcome {
    if summary.aborted {
        PassOutcome::Aborted
    } else {
        PassOutcome::Completed
    }
}

/// Four-digit year prefix of a date string like `2022-06-15`.
pub(crate) fn parse_year(date: &str) -> Option<i32> {
    date.get(..4)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_year() {
        assert_eq!(parse_year("2022-06-15"), Some(2022));
        assert_eq!(parse_year("2022"), Some(2022));
        assert_eq!(parse_year("20"), None);
        assert_eq!(parse_year("abcd-01-01"), None);
    }
}
