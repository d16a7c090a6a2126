//! Carrier vacancy collector against the USPS Addresses v3 API.
//!
//! OAuth2 client-credentials bearer auth, 60 requests/hour per consumer
//! key (token-scoped, not IP-scoped). Pacing and backoff live in the
//! caller-owned governor: one credential, one governor, one consumer.
//! Store-level `usps_check_date` is the authoritative result cache.

use serde_json::json;

use crate::error::CollectorError;
use crate::governor::RateGovernor;
use crate::models::readings::VacancyCheck;

const DEFAULT_TOKEN_URL: &str = "https://apis.usps.com/oauth2/v3/token";
const DEFAULT_ADDRESS_URL: &str = "https://apis.usps.com/addresses/v3/address";

pub struct VacancyClient {
    client: reqwest::Client,
    token_url: String,
    address_url: String,
    pub account: u32,
    client_id: String,
    client_secret: String,
}

impl VacancyClient {
    /// Credentials for account N come from `USPS_CLIENT_ID` /
    /// `USPS_CLIENT_SECRET` (account 1) or the `_N`-suffixed pair.
    pub fn from_env(account: u32) -> Result<Self, CollectorError> {
        let (id_var, secret_var) = if account == 1 {
            ("USPS_CLIENT_ID".to_string(), "USPS_CLIENT_SECRET".to_string())
        } else {
            (
                format!("USPS_CLIENT_ID_{account}"),
                format!("USPS_CLIENT_SECRET_{account}"),
            )
        };
        let client_id = std::env::var(&id_var)
            .map_err(|_| CollectorError::CredentialsMissing(id_var.clone()))?;
        let client_secret = std::env::var(&secret_var)
            .map_err(|_| CollectorError::CredentialsMissing(secret_var))?;
        Ok(Self::new(
            DEFAULT_TOKEN_URL,
            DEFAULT_ADDRESS_URL,
            account,
            client_id,
            client_secret,
        ))
    }

    pub fn new(
        token_url: impl Into<String>,
        address_url: impl Into<String>,
        account: u32,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: super::http_client(),
            token_url: token_url.into(),
            address_url: address_url.into(),
            account,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Refresh the bearer token through the governor's lazy-expiry window.
    async fn ensure_token(&self, governor: &mut RateGovernor) -> Result<String, CollectorError> {
        if let Some(token) = governor.valid_token() {
            return Ok(token.to_string());
        }
        let resp = self
            .client
            .post(&self.token_url)
            .json(&json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "grant_type": "client_credentials",
            }))
            .timeout(std::time::Duration::from_secs(super::TOKEN_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| CollectorError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(CollectorError::AuthFailed(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollectorError::AuthFailed(e.to_string()))?;
        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| CollectorError::AuthFailed("no access_token".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|e| e.as_u64()).unwrap_or(3600);
        governor.store_token(token.clone(), expires_in);
        tracing::info!(account = self.account, "vacancy api authenticated");
        Ok(token)
    }

    /// One vacancy check. Needs street plus (city + state) or zip; the
    /// governor paces the request and absorbs 429/5xx backoff.
    pub async fn check(
        &self,
        governor: &mut RateGovernor,
        street: &str,
        city: Option<&str>,
        state: Option<&str>,
        zip: Option<&str>,
    ) -> Result<VacancyCheck, CollectorError> {
        let token = self.ensure_token(governor).await?;
        governor.acquire().await;

        let mut params: Vec<(&str, &str)> = vec![("streetAddress", street)];
        if let Some(city) = city {
            params.push(("city", city));
        }
        if let Some(state) = state {
            params.push(("state", state));
        }
        if let Some(zip) = zip {
            params.push(("ZIPCode", zip));
        }

        let result = self
            .client
            .get(&self.address_url)
            .query(&params)
            .bearer_auth(&token)
            .send()
            .await;
        governor.mark_request();

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                let err = CollectorError::from_reqwest(&e);
                governor.backoff(None).await;
                return Err(err);
            }
        };

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            governor.backoff(retry_after).await;
            return Err(CollectorError::RateLimited { retry_after });
        }
        if status >= 500 {
            governor.backoff(None).await;
            return Err(CollectorError::HttpStatus { status });
        }
        if !resp.status().is_success() {
            // Structural rejection (bad address etc.) — no backoff.
            return Err(CollectorError::HttpStatus { status });
        }
        governor.record_success();

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollectorError::BadResponse(e.to_string()))?;
        Ok(parse_vacancy_response(&data, street))
    }
}

/// Y/N flag fields from the response; anything else reads as unknown.
pub fn parse_vacancy_response(data: &serde_json::Value, input_street: &str) -> VacancyCheck {
    let addr = data.get("address").cloned().unwrap_or_default();
    let info = data.get("additionalInfo").cloned().unwrap_or_default();

    let flag = |v: Option<&str>| match v {
        Some("Y") => Some(true),
        Some("N") => Some(false),
        _ => None,
    };
    let vacant = flag(info.get("vacant").and_then(|v| v.as_str()));
    let business = flag(info.get("business").and_then(|v| v.as_str()));
    // DPV confirmation codes: Y confirmed; N, S, D are degrees of
    // non-confirmation; anything else unknown.
    let dpv = match info.get("DPVConfirmation").and_then(|v| v.as_str()) {
        Some("Y") => Some(true),
        Some("N") | Some("S") | Some("D") => Some(false),
        _ => None,
    };

    let usps_address = addr
        .get("streetAddress")
        .and_then(|s| s.as_str())
        .map(str::to_string);
    let mismatch = detect_mismatch(input_street, usps_address.as_deref());

    VacancyCheck {
        vacant,
        dpv_confirmed: dpv,
        business,
        carrier_route: info
            .get("carrierRoute")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        usps_address,
        usps_city: addr.get("city").and_then(|c| c.as_str()).map(str::to_string),
        usps_state: addr.get("state").and_then(|s| s.as_str()).map(str::to_string),
        usps_zip: addr.get("ZIPCode").and_then(|z| z.as_str()).map(str::to_string),
        usps_zip4: addr.get("ZIPPlus4").and_then(|z| z.as_str()).map(str::to_string),
        address_mismatch: mismatch,
    }
}

/// Did the validator return a meaningfully different street? Containment
/// after whitespace normalization, or a shared house number, reads as
/// formatting rather than a mismatch.
pub fn detect_mismatch(input: &str, canonical: Option<&str>) -> bool {
    let Some(canonical) = canonical else {
        return false;
    };
    let a = input.to_uppercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let b = canonical
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if a.contains(&b) || b.contains(&a) {
        return false;
    }
    let a_first = a.split_whitespace().next();
    let b_first = b.split_whitespace().next();
    if let (Some(x), Some(y)) = (a_first, b_first) {
        if x == y {
            return false;
        }
    }
    true
}
