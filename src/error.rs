use thiserror::Error;

/// Outcome classification for a single collector call.
///
/// Transient errors leave the parcel's pass state untouched so the next run
/// re-selects it; permanent errors stamp the pass date so the parcel is not
/// retried against a known-bad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    Ok,
    Transient,
    Permanent,
    Skipped,
}

impl ErrorTag {
    pub fn is_ok(self) -> bool {
        matches!(self, ErrorTag::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorTag::Ok => "ok",
            ErrorTag::Transient => "transient",
            ErrorTag::Permanent => "permanent",
            ErrorTag::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("rate_limited")]
    RateLimited { retry_after: Option<u64> },

    #[error("http_{status}")]
    HttpStatus { status: u16 },

    #[error("timeout")]
    Timeout,

    #[error("network: {0}")]
    Network(String),

    #[error("no_imagery_at_location")]
    NoCoverage,

    #[error("insufficient_bands: {0}")]
    InsufficientBands(usize),

    #[error("unsupported_cog_layout: {0}")]
    UnsupportedCog(String),

    #[error("pixel_out_of_bounds")]
    PixelOutOfBounds,

    #[error("band_parse_failure: {0}")]
    BandParse(String),

    #[error("address_invalid: {0}")]
    AddressInvalid(String),

    #[error("credentials_missing: {0}")]
    CredentialsMissing(String),

    #[error("auth_failed: {0}")]
    AuthFailed(String),

    #[error("bad_response: {0}")]
    BadResponse(String),
}

impl CollectorError {
    /// Map an error kind onto its retry classification.
    pub fn tag(&self) -> ErrorTag {
        match self {
            CollectorError::RateLimited { .. } => ErrorTag::Transient,
            CollectorError::HttpStatus { status } if *status >= 500 => ErrorTag::Transient,
            CollectorError::Timeout | CollectorError::Network(_) => ErrorTag::Transient,
            CollectorError::AuthFailed(_) => ErrorTag::Transient,
            CollectorError::HttpStatus { .. } => ErrorTag::Permanent,
            CollectorError::NoCoverage
            | CollectorError::InsufficientBands(_)
            | CollectorError::UnsupportedCog(_)
            | CollectorError::PixelOutOfBounds
            | CollectorError::BandParse(_)
            | CollectorError::AddressInvalid(_)
            | CollectorError::BadResponse(_) => ErrorTag::Permanent,
            CollectorError::CredentialsMissing(_) => ErrorTag::Permanent,
        }
    }

    /// Short stable code stored in `*_error` columns and journals.
    pub fn code(&self) -> String {
        self.to_string()
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            CollectorError::Timeout
        } else if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                CollectorError::RateLimited { retry_after: None }
            } else {
                CollectorError::HttpStatus {
                    status: status.as_u16(),
                }
            }
        } else {
            CollectorError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_5xx_is_transient() {
        assert_eq!(
            CollectorError::HttpStatus { status: 503 }.tag(),
            ErrorTag::Transient
        );
    }

    #[test]
    fn test_4xx_is_permanent() {
        assert_eq!(
            CollectorError::HttpStatus { status: 404 }.tag(),
            ErrorTag::Permanent
        );
    }

    #[test]
    fn test_rate_limit_is_transient() {
        assert_eq!(
            CollectorError::RateLimited { retry_after: Some(60) }.tag(),
            ErrorTag::Transient
        );
    }

    #[test]
    fn test_insufficient_bands_is_permanent() {
        assert_eq!(CollectorError::InsufficientBands(3).tag(), ErrorTag::Permanent);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            CollectorError::RateLimited { retry_after: None }.code(),
            "rate_limited"
        );
        assert_eq!(CollectorError::HttpStatus { status: 503 }.code(), "http_503");
    }
}
