use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Parsed situs address components ready for the validation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSitus {
    pub street: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

const STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

/// Tokens that are simultaneously state codes and common street suffixes
/// ("CT" = Connecticut or Court). Resolved against the fallback state.
const AMBIGUOUS_STATE_SUFFIX: &[&str] = &["CT", "IN", "AL", "ME", "OR"];

const STREET_SUFFIXES: &[&str] = &[
    "ST", "AVE", "AV", "RD", "DR", "LN", "CT", "CIR", "BLVD", "WAY", "PL", "TRL", "LOOP", "HWY",
    "PKY", "PKWY", "COVE", "CV", "RUN", "PATH", "PASS", "PT", "PIKE", "SQ", "TER", "TERR", "ALY",
    "ROW", "WALK", "XING", "EXT", "BND", "CRES", "GRV", "HOLW", "IS", "KNL", "LK", "LNDG", "MALL",
    "MNR", "MDW", "MDWS", "ML", "MLS", "OVAL", "PARK", "PLZ", "RIDGE", "RDG", "SHR", "SPG",
    "SPUR", "TRCE", "VLY", "VW", "VISTA", "FRK", "GDNS", "GLN", "HTS", "JCT", "EST", "ESTS",
    "CTS", "STA", "CRK", "BR", "CLB", "CMN", "CORS", "CSWY",
];

const CITY_SKIP_WORDS: &[&str] = &["UNINC", "UNINCORP", "UNINCORPORATED", "COUNTY", "TWP", "TOWNSHIP"];

fn state_codes() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STATE_CODES.iter().copied().collect())
}

fn street_suffixes() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STREET_SUFFIXES.iter().copied().collect())
}

fn zip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}(-\d{4})?$").unwrap())
}

/// Split a free-form situs string into street / city / state / zip.
///
/// Token walk, right to left:
///   1. trailing ZIP (5 or 5+4, truncated to 5)
///   2. trailing 2-letter state code; ambiguous state-or-suffix tokens fall
///      back to suffix interpretation when the fallback state disagrees
///   3. city tokens collected leftward until a street suffix
///   4. skip-words at city position defer to the fallback city
///
/// Anything that doesn't match leaves the whole input as street with
/// city/state from fallbacks.
pub fn split_situs(
    situs: &str,
    fallback_state: Option<&str>,
    fallback_city: Option<&str>,
) -> ParsedSitus {
    let fallback = |street: String, zip: Option<String>| ParsedSitus {
        street,
        city: fallback_city.map(str::to_string),
        state: fallback_state.map(str::to_string),
        zip,
    };

    let mut parts: Vec<&str> = situs.split_whitespace().collect();
    if parts.is_empty() {
        return fallback(situs.to_string(), None);
    }

    // 1. Trailing ZIP
    let mut zip = None;
    if let Some(last) = parts.last() {
        if zip_re().is_match(last) {
            zip = Some(last[..5].to_string());
            parts.pop();
        }
    }
    if parts.is_empty() {
        return fallback(situs.trim().to_string(), zip);
    }

    // 2. Trailing state code (need at least "<street> <city> <state>")
    let last_upper = parts.last().unwrap().to_uppercase();
    if parts.len() >= 3 && state_codes().contains(last_upper.as_str()) {
        let state = last_upper;

        if AMBIGUOUS_STATE_SUFFIX.contains(&state.as_str()) {
            if let Some(fb) = fallback_state {
                if !fb.eq_ignore_ascii_case(&state) {
                    // "CT" at the end with a non-CT fallback is a street
                    // suffix, not Connecticut.
                    return fallback(parts.join(" "), zip);
                }
            }
        }

        let city_candidate = parts[parts.len() - 2].to_uppercase();

        // 4. Skip-words at the city position
        if CITY_SKIP_WORDS.contains(&city_candidate.as_str())
            || city_candidate.chars().all(|c| c.is_ascii_digit())
        {
            let street = parts[..parts.len() - 2].join(" ");
            return ParsedSitus {
                street,
                city: fallback_city.map(str::to_string),
                state: Some(state),
                zip,
            };
        }

        // 3. Walk left from the state collecting city tokens until a suffix
        let mut idx = parts.len() - 2;
        let mut city_parts: Vec<&str> = Vec::new();
        while idx > 0 {
            let token = parts[idx].to_uppercase();
            let token = token.trim_end_matches([',', '.']);
            if street_suffixes().contains(token) {
                break;
            }
            city_parts.insert(0, parts[idx]);
            idx -= 1;
        }

        if !city_parts.is_empty() {
            let street = parts[..=idx].join(" ");
            return ParsedSitus {
                street,
                city: Some(city_parts.join(" ")),
                state: Some(state),
                zip,
            };
        }
        // Everything before the state was street-shaped; treat the token
        // just before the state as the city anyway.
        let street = parts[..parts.len() - 2].join(" ");
        return ParsedSitus {
            street,
            city: Some(parts[parts.len() - 2].to_string()),
            state: Some(state),
            zip,
        };
    }

    // 5. No state found
    fallback(parts.join(" "), zip)
}
