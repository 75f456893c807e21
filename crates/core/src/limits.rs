//! Size limits for documents and keys.
//!
//! These are enforced by the collection layer before a write is handed to
//! the B+tree; violations surface as [`crate::ErrorKind::InvalidArgument`].
//! Defaults are conservative enough to keep a single page's worth of
//! overflow chain reasonable.

/// Configurable size limits, overridable at `open()` time.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum encoded key length in bytes, including compound-key
    /// terminators and the `_id` disambiguation suffix.
    pub max_key_bytes: usize,
    /// Maximum length of a single string value, in bytes.
    pub max_string_bytes: usize,
    /// Maximum length of a single bytes value.
    pub max_bytes_len: usize,
    /// Maximum encoded size of a whole document.
    pub max_document_bytes: usize,
    /// Maximum array length.
    pub max_array_len: usize,
    /// Maximum number of fields in a document or embedded document.
    pub max_fields: usize,
    /// Maximum document/array nesting depth.
    pub max_nesting_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_bytes: 1024,
            max_string_bytes: 16 * 1024 * 1024,
            max_bytes_len: 16 * 1024 * 1024,
            max_document_bytes: 16 * 1024 * 1024,
            max_array_len: 1_000_000,
            max_fields: 1_000_000,
            max_nesting_depth: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_positive() {
        let limits = Limits::default();
        assert!(limits.max_key_bytes > 0);
        assert!(limits.max_document_bytes >= limits.max_string_bytes);
    }
}
