use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

/// Delay/backoff policy for one credential.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Minimum jittered spacing between requests, seconds.
    pub min_delay: f64,
    /// Maximum jittered spacing between requests, seconds.
    pub max_delay: f64,
    /// First backoff step after an unheadered 429 / 5xx, seconds.
    pub backoff_base: f64,
    /// Backoff ceiling, seconds.
    pub backoff_cap: f64,
}

impl GovernorConfig {
    pub fn new(min_delay: f64, max_delay: f64) -> Self {
        Self {
            min_delay,
            max_delay,
            backoff_base: 120.0,
            backoff_cap: 900.0,
        }
    }

    /// Spacing for a target request rate per minute, with ±20% jitter range.
    pub fn per_minute(rate: f64) -> Self {
        let interval = 60.0 / rate.max(0.1);
        Self::new(interval * 0.8, interval * 1.2)
    }
}

/// Per-credential request regulator.
///
/// Spacing between requests is drawn uniformly from `[min_delay, max_delay]`
/// rather than fixed: gateways subdivide hourly quotas into micro-windows and
/// flag clients that arrive at exact intervals. Each governor is owned by a
/// single consumer; there is no cross-thread sharing of this state.
pub struct RateGovernor {
    pub label: String,
    cfg: GovernorConfig,
    last_request: Option<Instant>,
    consecutive_failures: u32,
    /// Multiplies the jittered spacing; doubled by 429s, decays on success.
    adaptive: f64,
    token: Option<String>,
    token_expiry: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl RateGovernor {
    pub fn new(label: impl Into<String>, cfg: GovernorConfig, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            label: label.into(),
            cfg,
            last_request: None,
            consecutive_failures: 0,
            adaptive: 1.0,
            token: None,
            token_expiry: None,
            shutdown,
        }
    }

    /// Block until the jittered inter-request spacing has elapsed.
    /// First request goes through immediately.
    pub async fn acquire(&mut self) {
        let Some(last) = self.last_request else { return };

        let target = {
            let mut rng = rand::rng();
            rng.random_range(self.cfg.min_delay..=self.cfg.max_delay) * self.adaptive
        };
        let elapsed = last.elapsed().as_secs_f64();
        if elapsed < target {
            let wait = target - elapsed;
            tracing::debug!(governor = %self.label, wait_secs = format!("{wait:.1}"), "pacing");
            interruptible_sleep(Duration::from_secs_f64(wait), &self.shutdown).await;
        }
    }

    /// Stamp the moment a request actually went out.
    pub fn mark_request(&mut self) {
        self.last_request = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.adaptive = (self.adaptive * 0.85).max(1.0);
    }

    /// Sleep out a 429 or 5xx. Honors `Retry-After` when the server sent one,
    /// otherwise escalates exponentially with jitter.
    pub async fn backoff(&mut self, retry_after: Option<u64>) {
        self.consecutive_failures += 1;
        let adaptive_cap = (self.cfg.backoff_cap / self.cfg.max_delay.max(0.1)).max(1.0);
        self.adaptive = (self.adaptive * 2.0).min(adaptive_cap);

        let wait = match retry_after {
            Some(secs) if secs > 0 => {
                let jitter = rand::rng().random_range(5.0..30.0);
                let wait = secs as f64 + jitter;
                tracing::warn!(
                    governor = %self.label,
                    retry_after = secs,
                    wait_secs = format!("{wait:.1}"),
                    consecutive = self.consecutive_failures,
                    "rate limited, honoring Retry-After"
                );
                wait
            }
            _ => {
                let base = (self.cfg.backoff_base
                    * 2f64.powi(self.consecutive_failures.saturating_sub(1) as i32))
                .min(self.cfg.backoff_cap);
                let wait = base * rand::rng().random_range(1.0..1.3);
                tracing::warn!(
                    governor = %self.label,
                    wait_secs = format!("{wait:.1}"),
                    consecutive = self.consecutive_failures,
                    "backing off"
                );
                wait
            }
        };

        interruptible_sleep(Duration::from_secs_f64(wait), &self.shutdown).await;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Bearer token if still valid (60 s refresh margin).
    pub fn valid_token(&self) -> Option<&str> {
        let expiry = self.token_expiry?;
        if Instant::now() + Duration::from_secs(60) < expiry {
            self.token.as_deref()
        } else {
            None
        }
    }

    pub fn store_token(&mut self, token: String, expires_in_secs: u64) {
        self.token = Some(token);
        self.token_expiry = Some(Instant::now() + Duration::from_secs(expires_in_secs));
    }
}

/// Sleep in slices no longer than 5 s, abandoning the wait once the shutdown
/// flag is set. Returns false if interrupted.
pub async fn interruptible_sleep(total: Duration, shutdown: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let slice = remaining.min(Duration::from_secs(5));
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    !shutdown.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(min: f64, max: f64) -> RateGovernor {
        RateGovernor::new(
            "test",
            GovernorConfig::new(min, max),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let mut gov = governor(30.0, 55.0);
        let start = Instant::now();
        gov.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_waits_out_spacing() {
        let mut gov = governor(0.05, 0.10);
        gov.mark_request();
        let start = Instant::now();
        gov.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let flag = Arc::new(AtomicBool::new(true));
        let start = Instant::now();
        let completed = interruptible_sleep(Duration::from_secs(60), &flag).await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut gov = governor(1.0, 2.0);
        gov.consecutive_failures = 5;
        gov.record_success();
        assert_eq!(gov.consecutive_failures(), 0);
    }

    #[test]
    fn test_token_validity_margin() {
        let mut gov = governor(1.0, 2.0);
        assert!(gov.valid_token().is_none());
        gov.store_token("abc".into(), 3600);
        assert_eq!(gov.valid_token(), Some("abc"));
        // Inside the 60 s refresh margin the token reads as expired.
        gov.store_token("xyz".into(), 30);
        assert!(gov.valid_token().is_none());
    }

    #[test]
    fn test_per_minute_config() {
        let cfg = GovernorConfig::per_minute(40.0);
        assert!((cfg.min_delay - 1.2).abs() < 1e-9);
        assert!((cfg.max_delay - 1.8).abs() < 1e-9);
    }
}
