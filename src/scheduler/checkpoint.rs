//! Advisory run checkpoints.
//!
//! Written on every flush so external monitors can poll progress, and left
//! behind with a `complete` status when a run finishes. Resumability does
//! NOT depend on these files: the store's eligibility predicates are the
//! source of truth, checkpoints are a window into a running job.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub run_id: String,
    pub pid: u32,
    pub total: usize,
    pub stats: serde_json::Value,
    pub updated_at: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
}

fn checkpoint_dir() -> PathBuf {
    std::env::var("CHECKPOINT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

fn checkpoint_path(job_name: &str) -> PathBuf {
    checkpoint_dir().join(format!("distress_checkpoint_{job_name}.json"))
}

/// Best-effort write; a failed checkpoint never fails the run.
pub fn save(job_name: &str, run_id: &str, total: usize, stats: serde_json::Value) {
    let checkpoint = Checkpoint {
        job_name: job_name.to_string(),
        run_id: run_id.to_string(),
        pid: std::process::id(),
        total,
        stats,
        updated_at: Utc::now().to_rfc3339(),
        status: None,
        elapsed_secs: None,
    };
    write(&checkpoint);
}

pub fn mark_complete(
    job_name: &str,
    run_id: &str,
    total: usize,
    stats: serde_json::Value,
    elapsed_secs: f64,
) {
    let checkpoint = Checkpoint {
        job_name: job_name.to_string(),
        run_id: run_id.to_string(),
        pid: std::process::id(),
        total,
        stats,
        updated_at: Utc::now().to_rfc3339(),
        status: Some("complete".to_string()),
        elapsed_secs: Some(elapsed_secs),
    };
    write(&checkpoint);
}

fn write(checkpoint: &Checkpoint) {
    let path = checkpoint_path(&checkpoint.job_name);
    match serde_json::to_string_pretty(checkpoint) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&path, text) {
                tracing::debug!("checkpoint write failed: {e}");
            }
        }
        Err(e) => tracing::debug!("checkpoint serialize failed: {e}"),
    }
}

pub fn load(job_name: &str) -> Option<Checkpoint> {
    let text = std::fs::read_to_string(checkpoint_path(job_name)).ok()?;
    serde_json::from_str(&text).ok()
}
