//! TTL expiry helpers (§4.13). The TTL structure itself is just a
//! [`crate::index::IndexDefinition`] of kind [`crate::index::IndexKind::Ttl`]
//! whose key is the expiry timestamp; [`crate::catalog::Catalog::sweep_ttl`]
//! does the actual background scan-and-delete through the normal
//! collection path.

/// Whether a document indexed at `indexed_timestamp` (seconds since
/// epoch) has expired under `ttl_seconds`, as of `now`.
pub fn is_expired(indexed_timestamp: i64, ttl_seconds: i64, now: i64) -> bool {
    now.saturating_sub(indexed_timestamp) >= ttl_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_once_ttl_elapsed() {
        assert!(is_expired(1000, 60, 1061));
        assert!(!is_expired(1000, 60, 1059));
    }
}
