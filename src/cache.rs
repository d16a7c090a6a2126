use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Content-addressed JSON response cache.
///
/// Keys are sha256 over `{namespace}:{params-json}`, truncated to 16 hex
/// chars. Hits bypass both the network and the rate governor. Expired files
/// are unlinked on read.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Option<Duration>,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self { dir: dir.into(), ttl }
    }

    pub fn key(namespace: &str, params: &impl Serialize) -> String {
        let params_json = serde_json::to_string(params).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(format!("{namespace}:{params_json}").as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }
        if self.expired(&path) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                    None
                }
            },
            Err(_) => None,
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let path = self.path_for(key);
        match serde_json::to_string(value) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, text) {
                    tracing::warn!("cache write failed for {key}: {e}");
                }
            }
            Err(e) => tracing::warn!("cache serialize failed for {key}: {e}"),
        }
    }

    fn expired(&self, path: &Path) -> bool {
        let Some(ttl) = self.ttl else { return false };
        let age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
        match age {
            Some(age) => age > ttl,
            None => false,
        }
    }
}

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic() {
        let a = ResponseCache::key("identify", &json!({"lat": 35.2, "lng": -80.8}));
        let b = ResponseCache::key("identify", &json!({"lat": 35.2, "lng": -80.8}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_key_varies_by_namespace() {
        let a = ResponseCache::key("identify", &json!({"lat": 1.0}));
        let b = ResponseCache::key("flood_zone", &json!({"lat": 1.0}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), Some(DAY));
        let key = ResponseCache::key("t", &json!({"x": 1}));
        cache.put(&key, &json!({"ndvi": 0.42}));
        let got: Option<serde_json::Value> = cache.get(&key);
        assert_eq!(got.unwrap()["ndvi"], 0.42);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), Some(Duration::ZERO));
        let key = ResponseCache::key("t", &json!({"x": 2}));
        cache.put(&key, &json!({"v": 1}));
        std::thread::sleep(Duration::from_millis(20));
        let got: Option<serde_json::Value> = cache.get(&key);
        assert!(got.is_none());
        assert!(!dir.path().join(format!("{key}.json")).exists());
    }

    #[test]
    fn test_corrupt_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), Some(DAY));
        std::fs::write(dir.path().join("deadbeef00000000.json"), "{not json").unwrap();
        let got: Option<serde_json::Value> = cache.get("deadbeef00000000");
        assert!(got.is_none());
    }
}
