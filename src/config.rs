use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Engine-level configuration: where the store, caches, artifacts, and
/// journals live. A `distress.toml` file supplies defaults; environment
/// variables override it (deployment convention: env wins).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub cache_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub journal_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct PathsConfig {
    #[serde(default = "default_database")]
    database: String,
    #[serde(default = "default_cache_dir")]
    cache_dir: String,
    #[serde(default = "default_storage_dir")]
    storage_dir: String,
    #[serde(default = "default_journal_dir")]
    journal_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            cache_dir: default_cache_dir(),
            storage_dir: default_storage_dir(),
            journal_dir: default_journal_dir(),
        }
    }
}

fn default_database() -> String {
    "parcels.db".to_string()
}

fn default_cache_dir() -> String {
    "data/cache".to_string()
}

fn default_storage_dir() -> String {
    "data".to_string()
}

fn default_journal_dir() -> String {
    "journal".to_string()
}

impl EngineConfig {
    /// Load from `DISTRESS_CONFIG` (or `./distress.toml` if present), then
    /// apply env overrides. Missing file means pure defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("DISTRESS_CONFIG").unwrap_or_else(|_| "distress.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let file_config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let parsed: FileConfig = toml::from_str(&contents)?;
            tracing::info!("loaded config from {}", path.display());
            parsed
        } else {
            FileConfig::default()
        };

        let paths = file_config.paths;
        Ok(Self {
            database_path: std::env::var("DATABASE_PATH").unwrap_or(paths.database),
            cache_dir: env_or("CACHE_DIR", &paths.cache_dir),
            storage_dir: env_or("STORAGE_DIR", &paths.storage_dir),
            journal_dir: env_or("JOURNAL_DIR", &paths.journal_dir),
        })
    }

    pub fn cache_subdir(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }
}

fn env_or(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(fallback))
}
