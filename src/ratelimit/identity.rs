//! Client identity derivation from request metadata.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const USER_AGENT: &str = "user-agent";
const ACCEPT: &str = "accept";

/// Number of hex characters kept from the user-agent digest.
const UA_HASH_LEN: usize = 16;

/// Case-insensitive bag of request header values supplied by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    values: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing any previous value with the same name.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.values
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = RequestHeaders::new();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value.as_ref());
        }
        headers
    }
}

/// Derive the client key for a request.
///
/// With a trusted proxy the leading forwarded address wins (`ip:<addr>`).
/// Otherwise the caller is bucketed by a digest of its user-agent and accept
/// headers (`ua:<hash16>`), which groups identical browser profiles rather
/// than identifying individuals. Missing headers hash as empty strings.
pub fn resolve_client_key(headers: &RequestHeaders, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(addr) = forwarded_address(headers) {
            return format!("ip:{}", addr);
        }
    }

    let user_agent = headers.get(USER_AGENT).unwrap_or_default();
    let accept = headers.get(ACCEPT).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(accept.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("ua:{}", &digest[..UA_HASH_LEN])
}

fn forwarded_address(headers: &RequestHeaders) -> Option<&str> {
    [FORWARDED_FOR, REAL_IP].into_iter().find_map(|name| {
        headers
            .get(name)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    })
}

/// Mask an email so logs never carry the full address: `a***@x.com`.
pub fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser() -> RequestHeaders {
        RequestHeaders::new()
            .with("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with("Accept", "text/html")
    }

    #[test]
    fn test_trusted_proxy_uses_first_forwarded_address() {
        let headers = browser().with("X-Forwarded-For", " 203.0.113.7 , 10.0.0.1");
        assert_eq!(resolve_client_key(&headers, true), "ip:203.0.113.7");
    }

    #[test]
    fn test_trusted_proxy_falls_back_to_real_ip() {
        let headers = browser().with("x-real-ip", "198.51.100.2");
        assert_eq!(resolve_client_key(&headers, true), "ip:198.51.100.2");
    }

    #[test]
    fn test_untrusted_proxy_ignores_forwarded_header() {
        let spoofed = browser().with("x-forwarded-for", "1.2.3.4");
        let key = resolve_client_key(&spoofed, false);
        assert!(key.starts_with("ua:"));
        assert_eq!(key, resolve_client_key(&browser(), false));
    }

    #[test]
    fn test_user_agent_key_is_stable_and_truncated() {
        let first = resolve_client_key(&browser(), false);
        let second = resolve_client_key(&browser(), false);
        assert_eq!(first, second);
        assert_eq!(first.len(), "ua:".len() + UA_HASH_LEN);
        assert!(first[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_profiles_get_different_keys() {
        let other = RequestHeaders::new()
            .with("user-agent", "curl/8.4.0")
            .with("accept", "*/*");
        assert_ne!(
            resolve_client_key(&browser(), false),
            resolve_client_key(&other, false)
        );
    }

    #[test]
    fn test_missing_headers_still_yield_a_key() {
        let key = resolve_client_key(&RequestHeaders::new(), true);
        // SHA-256 of the empty string
        assert_eq!(key, "ua:e3b0c44298fc1c14");
    }

    #[test]
    fn test_empty_forwarded_header_falls_back_to_hash() {
        let headers = RequestHeaders::new().with("x-forwarded-for", " ");
        assert!(resolve_client_key(&headers, true).starts_with("ua:"));
    }

    #[test]
    fn test_headers_from_iter() {
        let headers: RequestHeaders = [("Accept", "a"), ("ACCEPT", "b")].into_iter().collect();
        assert_eq!(headers.get("accept"), Some("b"));
    }

    #[test]
    fn test_redact_email() {
        assert_eq!(redact_email("alice@example.com"), "a***@example.com");
        assert_eq!(redact_email("not-an-email"), "***");
    }
}
