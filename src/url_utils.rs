//! URL utilities: canonical forms, host keys and stable fingerprints.

use sha2::{Digest, Sha256};
use url::Url;

/// Canonical form used for deduplication. Equivalent spellings of one
/// resource map to the same string; unparsable input yields `None`.
pub fn canonicalize(uri: &str) -> Option<String> {
    // Url::parse already lower-cases scheme and host, drops default ports
    // and resolves dot segments.
    let mut url = Url::parse(uri.trim()).ok()?;
    url.set_fragment(None);

    if let Some(host) = url.host_str()
        && host.ends_with('.')
    {
        let trimmed = host.trim_end_matches('.').to_string();
        if trimmed.is_empty() {
            return None;
        }
        url.set_host(Some(&trimmed)).ok()?;
    }

    if url.query() == Some("") {
        url.set_query(None);
    }

    Some(url.to_string())
}

/// `host[:port]`, with the port only when it is not the scheme default.
/// `dns:` URIs key on the name being looked up.
pub fn host_key(uri: &str) -> Option<String> {
    let url = Url::parse(uri.trim()).ok()?;
    if url.scheme() == "dns" {
        let target = url.path().trim_end_matches('.').to_ascii_lowercase();
        return (!target.is_empty()).then_some(target);
    }

    let host = url.host_str()?.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    match url.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host.to_string()),
    }
}

/// Stable 64-bit fingerprint (leading 8 bytes of SHA-256). Unlike
/// `DefaultHasher` this does not change between builds, so it is safe to persist.
pub fn fingerprint64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Dedup key for a canonical URI: 24 bits from `scheme://host` in the high
/// bits, 40 bits from the full URI below them, so one host's keys cluster.
pub fn uniq_key(canonical: &str) -> u64 {
    let authority = match Url::parse(canonical) {
        Ok(url) => match host_key(canonical) {
            Some(key) => format!("{}://{}", url.scheme(), key),
            None => url.scheme().to_string(),
        },
        Err(_) => String::new(),
    };
    let high = (fingerprint64(&authority) >> 40) << 40;
    let low = fingerprint64(canonical) >> 24;
    high | low
}
