//! Newline-delimited JSON outage journal.
//!
//! When a flush cannot reach the store, the batch is appended here instead
//! of being dropped; a later `--replay` run lands the rows without
//! re-spending API quota. Files are opened per append and closed again to
//! keep the crash window small.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub struct Journal {
    dir: PathBuf,
    prefix: String,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    fn current_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y%m%d");
        self.dir.join(format!("{}_{date}.jsonl", self.prefix))
    }

    /// Append rows, one JSON object per line, stamped with the producing
    /// account and an ISO timestamp. Returns the journal path.
    pub fn append<T: Serialize>(
        &self,
        rows: &[T],
        account: Option<u32>,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.current_path();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let ts = Utc::now().to_rfc3339();
        for row in rows {
            let mut value = serde_json::to_value(row)?;
            if let Some(obj) = value.as_object_mut() {
                if let Some(account) = account {
                    obj.insert("_account".into(), serde_json::json!(account));
                }
                obj.insert("_ts".into(), serde_json::json!(ts));
            }
            serde_json::to_writer(&mut file, &value)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        tracing::info!(path = %path.display(), records = rows.len(), "journal appended");
        Ok(path)
    }

    /// Parse a journal file back into rows. Blank lines are skipped; the
    /// `_`-prefixed metadata fields are ignored by the row types.
    pub fn read_rows<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
        let text = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    /// Rename a fully replayed journal so it is not replayed twice.
    pub fn mark_replayed(path: &Path) -> anyhow::Result<PathBuf> {
        let replayed = path.with_extension("jsonl.replayed");
        std::fs::rename(path, &replayed)?;
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parcel::UspsResult;

    fn usps_row(id: &str, error: Option<&str>) -> UspsResult {
        UspsResult {
            parcel_id: id.into(),
            county: "CtyA".into(),
            account: None,
            usps_vacant: Some(true),
            usps_dpv_confirmed: Some(true),
            usps_address: None,
            usps_city: None,
            usps_zip: None,
            usps_zip4: None,
            usps_business: None,
            usps_carrier_route: None,
            usps_address_mismatch: false,
            usps_error: error.map(str::to_string),
            flag_vacancy: error.is_none(),
            vacancy_confidence: if error.is_none() { Some(0.9) } else { None },
        }
    }

    #[test]
    fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "usps_results");
        let rows = vec![usps_row("P1", None), usps_row("P2", Some("rate_limited"))];

        let path = journal.append(&rows, Some(3)).unwrap();
        let read: Vec<UspsResult> = Journal::read_rows(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].parcel_id, "P1");
        assert_eq!(read[1].usps_error.as_deref(), Some("rate_limited"));

        // Metadata rides along in the raw lines.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"_account\":3"));
        assert!(raw.contains("\"_ts\""));
    }

    #[test]
    fn test_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "usps_results");
        journal.append(&[usps_row("P1", None)], None).unwrap();
        let path = journal.append(&[usps_row("P2", None)], None).unwrap();
        let read: Vec<UspsResult> = Journal::read_rows(&path).unwrap();
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn test_mark_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "usps_results");
        let path = journal.append(&[usps_row("P1", None)], None).unwrap();
        let renamed = Journal::mark_replayed(&path).unwrap();
        assert!(!path.exists());
        assert!(renamed.exists());
        assert!(renamed.to_string_lossy().ends_with(".jsonl.replayed"));
    }

    #[test]
    fn test_read_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let line = serde_json::to_string(&usps_row("P1", None)).unwrap();
        std::fs::write(&path, format!("{line}\n\n{line}\n")).unwrap();
        let read: Vec<UspsResult> = Journal::read_rows(&path).unwrap();
        assert_eq!(read.len(), 2);
    }
}
