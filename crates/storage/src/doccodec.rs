//! Self-describing document blob codec, used to store whole documents
//! as B+tree leaf values. Distinct from [`lauradb_core::key`], which
//! encodes scalars for ordered index keys; this codec just needs a
//! faithful, compact round-trip of an entire [`Document`].

use lauradb_core::{Document, Error, Result};

/// Serialize a document to bytes for a leaf slot (or an overflow chain
/// if it exceeds [`crate::overflow::OVERFLOW_THRESHOLD`]).
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    bincode::serialize(doc).map_err(|e| Error::corruption(format!("document encode failed: {e}")))
}

/// Parse a document previously produced by [`encode_document`].
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    bincode::deserialize(bytes).map_err(|e| Error::corruption(format!("document decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_core::Value;

    #[test]
    fn round_trips_preserving_field_order() {
        let mut doc = Document::new();
        doc.set("z", Value::Int64(1));
        doc.set("a", Value::String("hi".into()));
        doc.set("m", Value::Array(vec![Value::Bool(true), Value::Null]));
        let bytes = encode_document(&doc).unwrap();
        let back = decode_document(&bytes).unwrap();
        assert_eq!(doc, back);
        assert_eq!(
            back.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec!["z".to_string(), "a".to_string(), "m".to_string()]
        );
    }

    #[test]
    fn rejects_truncated_bytes() {
        let mut doc = Document::new();
        doc.set("a", Value::Int64(1));
        let mut bytes = encode_document(&doc).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(decode_document(&bytes).is_err());
    }
}
