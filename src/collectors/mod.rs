//! Signal collectors: one per external source.
//!
//! Every collector is point-query shaped: `(lat, lng, opts) -> result` with
//! errors returned as values and classified transient/permanent by
//! `CollectorError::tag`. Collectors consult their content-addressed cache
//! before touching the network; cache hits bypass the governor entirely.

pub mod aerial;
pub mod cog;
pub mod flood;
pub mod geocoder;
pub mod historical;
pub mod scenes;
pub mod trends;
pub mod vacancy;

pub const IDENTIFY_TIMEOUT_SECS: u64 = 30;
pub const TOKEN_TIMEOUT_SECS: u64 = 30;
pub const THUMBNAIL_TIMEOUT_SECS: u64 = 15;

/// Shared HTTP client for the 30 s identify/search-class endpoints.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(IDENTIFY_TIMEOUT_SECS))
        .user_agent("distress-engine/0.3")
        .build()
        .expect("reqwest client")
}
