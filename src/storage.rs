use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

/// Artifact storage seam. Collectors hand bytes over and store whatever URL
/// (or path) comes back on the parcel row; missing remote storage degrades
/// to the local filesystem.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> anyhow::Result<String>;
}

/// Filesystem-backed store rooted at a data directory.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn upload(&self, key: &str, data: &[u8], _content_type: &str) -> anyhow::Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::debug!(key, size = data.len(), "artifact stored locally");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Key for a parcel-scoped artifact:
/// `{county}_{state}/{parcel_id}/{yyyy-mm-dd}/{artifact}`.
pub fn make_key(county: &str, state_code: &str, parcel_id: &str, filename: &str) -> String {
    let county_slug = format!(
        "{}_{}",
        county.to_lowercase().replace(' ', "_"),
        state_code.to_lowercase()
    );
    let parcel_slug = parcel_id.replace(['/', ' '], "_");
    let date = Utc::now().format("%Y-%m-%d");
    format!("{county_slug}/{parcel_slug}/{date}/{filename}")
}

/// Key for a pre-parcel point scan: `points/{lat:.4}_{lng:.4}/{date}/{artifact}`.
pub fn make_point_key(lat: f64, lng: f64, filename: &str) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    format!("points/{lat:.4}_{lng:.4}/{date}/{filename}")
}
