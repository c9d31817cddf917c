//! Relay URL normalization and validation.
//!
//! Relay lists come from configuration and the command line, so the same
//! relay often shows up spelled differently. Normalizing keeps health
//! tallies and subscription fan-out keyed by one canonical string.
//!
//! # Normalization Rules
//!
//! - Only `wss://` and `ws://` are accepted
//! - Scheme and host are lowercased
//! - Default ports are dropped, other ports and paths are preserved
//! - Trailing slashes are removed
//! - Credentials, queries and fragments are rejected

use url::Url;

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid or not a relay URL.
    Invalid(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            Self::Invalid(_) => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL.
///
/// # Examples
///
/// ```ignore
/// use larder_cache::relay::url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok(),
///     Some("wss://relay.example.com".to_string())
/// );
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let url = url.trim();

    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("wss://") && !lower.starts_with("ws://") {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(format!("Invalid relay URL: {}", e)),
    };

    if parsed.host_str().is_none_or(str::is_empty) {
        return NormalizeResult::Invalid("URL has no host".to_string());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return NormalizeResult::Invalid("credentials in relay URL not allowed".to_string());
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return NormalizeResult::Invalid("query or fragment in relay URL not allowed".to_string());
    }

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    NormalizeResult::Ok(normalized)
}

/// Check if a URL is a Tor hidden service.
pub fn is_onion_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with(".onion")))
        .unwrap_or(false)
}
