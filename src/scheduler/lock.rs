//! Single-run pid-file lock.
//!
//! Passes that spend a shared external quota must not run twice at once.
//! A stale lock (owner pid no longer alive) is removed; a live lock aborts
//! the new run. Released on drop, which covers both normal exit and the
//! graceful-shutdown path.

use std::path::PathBuf;

pub struct RunLock {
    path: PathBuf,
}

fn lock_dir() -> PathBuf {
    std::env::var("LOCK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

impl RunLock {
    pub fn acquire(name: &str) -> anyhow::Result<RunLock> {
        let path = lock_dir().join(format!("{name}.lock"));

        if path.exists() {
            let holder: Option<u32> = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse().ok());
            match holder {
                Some(pid) if pid_alive(pid) && pid != std::process::id() => {
                    anyhow::bail!(
                        "another run holds {} (pid {pid}); remove the lock if it is stale",
                        path.display()
                    );
                }
                _ => {
                    tracing::warn!(path = %path.display(), "removing stale lock");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        std::fs::write(&path, std::process::id().to_string())?;
        Ok(RunLock { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers the lifecycle: LOCK_DIR is process-global, so the
    // scenarios must not run concurrently.
    #[test]
    fn test_lock_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("LOCK_DIR", dir.path());

        // Acquire writes the pid file, drop removes it.
        let lock = RunLock::acquire("test_lock").unwrap();
        let path = dir.path().join("test_lock.lock");
        assert!(path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(lock);
        assert!(!path.exists());

        // A stale lock (dead pid) is replaced.
        std::fs::write(&path, "4294967294").unwrap();
        let lock = RunLock::acquire("test_lock").unwrap();
        drop(lock);

        // A garbage lock file is treated as stale.
        std::fs::write(&path, "not a pid").unwrap();
        assert!(RunLock::acquire("test_lock").is_ok());

        std::env::remove_var("LOCK_DIR");
    }
}
