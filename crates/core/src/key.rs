//! Byte-ordered key encoding (§4.5 key codec).
//!
//! Every encoded key begins with a one-byte type tag so that values of
//! different types never compare ambiguously, followed by a type-specific
//! payload. Integers are zig-zag encoded so that negative numbers sort
//! before positive ones; strings and bytes are length-prefixed so a
//! shorter string never accidentally becomes a prefix of a longer one
//! once the terminator byte (`0x00`) is appended to compound keys.
//!
//! Compound keys concatenate each element's encoding with a `0x00`
//! terminator; unique indexes key on the field only, non-unique indexes
//! append the record's `_id` so that keys with equal indexed values still
//! impose a total order.

use crate::object_id::ObjectId;
use crate::value::{TypeTag, Value};

/// Tag bytes, ordered to match the natural ordering in §3: null < bool <
/// int < double < string < bytes < timestamp < object-id < array <
/// document.
mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL_FALSE: u8 = 1;
    pub const BOOL_TRUE: u8 = 2;
    pub const INT64: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BYTES: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const OBJECT_ID: u8 = 8;
    pub const ARRAY: u8 = 9;
    pub const DOCUMENT: u8 = 10;
    pub const ARRAY_END: u8 = 11;
    pub const DOCUMENT_END: u8 = 12;
}

/// Zig-zag encode a signed 64-bit integer so that unsigned byte-order
/// comparison of the encoded form matches signed numeric comparison.
fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Encode an f64 so that unsigned byte-order comparison matches IEEE-754
/// total order for non-NaN values: flip the sign bit for positives, flip
/// all bits for negatives.
fn double_encode(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn double_decode(bits: u64) -> f64 {
    let raw = if bits & (1 << 63) != 0 {
        bits & !(1 << 63)
    } else {
        !bits
    };
    f64::from_bits(raw)
}

/// Append the byte-ordered encoding of `value` to `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(tag::NULL),
        Value::Bool(false) => out.push(tag::BOOL_FALSE),
        Value::Bool(true) => out.push(tag::BOOL_TRUE),
        Value::Int64(i) => {
            out.push(tag::INT64);
            out.extend_from_slice(&zigzag_encode(*i).to_be_bytes());
        }
        Value::Double(d) => {
            out.push(tag::DOUBLE);
            out.extend_from_slice(&double_encode(*d).to_be_bytes());
        }
        Value::String(s) => {
            out.push(tag::STRING);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(tag::BYTES);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Value::Timestamp(ts) => {
            out.push(tag::TIMESTAMP);
            out.extend_from_slice(&zigzag_encode(*ts).to_be_bytes());
        }
        Value::ObjectId(id) => {
            out.push(tag::OBJECT_ID);
            out.extend_from_slice(id.as_bytes());
        }
        Value::Array(items) => {
            out.push(tag::ARRAY);
            for item in items {
                encode_value(item, out);
            }
            out.push(tag::ARRAY_END);
        }
        Value::Document(doc) => {
            out.push(tag::DOCUMENT);
            for (k, v) in doc.iter() {
                out.extend_from_slice(&(k.len() as u32).to_be_bytes());
                out.extend_from_slice(k.as_bytes());
                encode_value(v, out);
            }
            out.push(tag::DOCUMENT_END);
        }
    }
}

/// Decode a single value from the front of `buf`, returning the value and
/// the number of bytes consumed.
pub fn decode_value(buf: &[u8]) -> Result<(Value, usize), String> {
    let tag_byte = *buf.first().ok_or("empty key buffer")?;
    let mut pos = 1usize;
    let value = match tag_byte {
        tag::NULL => Value::Null,
        tag::BOOL_FALSE => Value::Bool(false),
        tag::BOOL_TRUE => Value::Bool(true),
        tag::INT64 => {
            let bytes: [u8; 8] = buf[pos..pos + 8].try_into().map_err(|_| "truncated int64")?;
            pos += 8;
            Value::Int64(zigzag_decode(u64::from_be_bytes(bytes)))
        }
        tag::DOUBLE => {
            let bytes: [u8; 8] = buf[pos..pos + 8].try_into().map_err(|_| "truncated double")?;
            pos += 8;
            Value::Double(double_decode(u64::from_be_bytes(bytes)))
        }
        tag::STRING => {
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().map_err(|_| "truncated string len")?) as usize;
            pos += 4;
            let s = std::str::from_utf8(&buf[pos..pos + len]).map_err(|_| "invalid utf8")?;
            pos += len;
            Value::String(s.to_string())
        }
        tag::BYTES => {
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().map_err(|_| "truncated bytes len")?) as usize;
            pos += 4;
            let b = buf[pos..pos + len].to_vec();
            pos += len;
            Value::Bytes(b)
        }
        tag::TIMESTAMP => {
            let bytes: [u8; 8] = buf[pos..pos + 8].try_into().map_err(|_| "truncated timestamp")?;
            pos += 8;
            Value::Timestamp(zigzag_decode(u64::from_be_bytes(bytes)))
        }
        tag::OBJECT_ID => {
            let bytes: [u8; 12] = buf[pos..pos + 12].try_into().map_err(|_| "truncated object id")?;
            pos += 12;
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        tag::ARRAY => {
            let mut items = Vec::new();
            while buf[pos] != tag::ARRAY_END {
                let (v, consumed) = decode_value(&buf[pos..])?;
                pos += consumed;
                items.push(v);
            }
            pos += 1; // ARRAY_END
            Value::Array(items)
        }
        tag::DOCUMENT => {
            let mut doc = crate::value::Document::new();
            while buf[pos] != tag::DOCUMENT_END {
                let klen = u32::from_be_bytes(buf[pos..pos + 4].try_into().map_err(|_| "truncated field name len")?) as usize;
                pos += 4;
                let name = std::str::from_utf8(&buf[pos..pos + klen]).map_err(|_| "invalid utf8 field name")?.to_string();
                pos += klen;
                let (v, consumed) = decode_value(&buf[pos..])?;
                pos += consumed;
                doc.set(name, v);
            }
            pos += 1; // DOCUMENT_END
            Value::Document(doc)
        }
        other => return Err(format!("unknown key tag byte {other}")),
    };
    Ok((value, pos))
}

/// A single encoded key element, plus the terminator byte used to join
/// elements of a compound key unambiguously.
const COMPOUND_TERMINATOR: u8 = 0xFF;

/// Encode a compound key: one encoded element per field path, each
/// followed by a terminator so that, e.g., `("ab", "c")` never collides
/// with `("a", "bc")`.
pub fn encode_compound(values: &[&Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode_value(v, &mut out);
        out.push(COMPOUND_TERMINATOR);
    }
    out
}

/// Encode the non-unique disambiguation suffix: the record's `_id`
/// appended after the indexed field's encoding, per §3/§4.4.
pub fn encode_non_unique(field_values: &[&Value], id: &ObjectId) -> Vec<u8> {
    let mut out = encode_compound(field_values);
    encode_value(&Value::ObjectId(*id), &mut out);
    out
}

/// Compute the tightest prefix range `[prefix, prefix_upper_bound)` that
/// contains every key with `prefix` as a literal leading byte sequence.
/// Used by the planner to lower anchored-prefix regexes to a range scan
/// (§4.5).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xFF {
            upper[i] += 1;
            upper.truncate(i + 1);
            return Some(upper);
        }
    }
    None // prefix is all 0xFF bytes; no finite upper bound exists.
}

/// The type tag a decoded key's leading byte implies, for planner
/// diagnostics and validator checks.
pub fn peek_type_tag(buf: &[u8]) -> Option<TypeTag> {
    match *buf.first()? {
        tag::NULL => Some(TypeTag::Null),
        tag::BOOL_FALSE | tag::BOOL_TRUE => Some(TypeTag::Bool),
        tag::INT64 => Some(TypeTag::Int64),
        tag::DOUBLE => Some(TypeTag::Double),
        tag::STRING => Some(TypeTag::String),
        tag::BYTES => Some(TypeTag::Bytes),
        tag::TIMESTAMP => Some(TypeTag::Timestamp),
        tag::OBJECT_ID => Some(TypeTag::ObjectId),
        tag::ARRAY => Some(TypeTag::Array),
        tag::DOCUMENT => Some(TypeTag::Document),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Document;

    fn roundtrip(v: Value) {
        let mut buf = Vec::new();
        encode_value(&v, &mut buf);
        let (decoded, consumed) = decode_value(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(v, decoded);
    }

    #[test]
    fn scalars_round_trip() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int64(-42));
        roundtrip(Value::Double(3.25));
        roundtrip(Value::String("hello".into()));
        roundtrip(Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Timestamp(1_700_000_000));
        roundtrip(Value::ObjectId(ObjectId::new()));
    }

    #[test]
    fn nested_structures_round_trip() {
        let mut doc = Document::new();
        doc.set("a", Value::Int64(1));
        doc.set("b", Value::Array(vec![Value::String("x".into()), Value::Null]));
        roundtrip(Value::Document(doc));
    }

    #[test]
    fn integer_ordering_survives_encoding() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_value(&Value::Int64(-5), &mut a);
        encode_value(&Value::Int64(5), &mut b);
        assert!(a < b, "negative must sort before positive after zig-zag");
    }

    #[test]
    fn double_ordering_matches_numeric_order() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_value(&Value::Double(-1.5), &mut a);
        encode_value(&Value::Double(2.5), &mut b);
        assert!(a < b);
    }

    #[test]
    fn cross_type_ordering_matches_data_model() {
        let mut n = Vec::new();
        let mut s = Vec::new();
        encode_value(&Value::Null, &mut n);
        encode_value(&Value::String("a".into()), &mut s);
        assert!(n < s, "null must sort before string");
    }

    #[test]
    fn string_length_prefix_prevents_prefix_ambiguity() {
        let mut short = Vec::new();
        let mut long = Vec::new();
        encode_value(&Value::String("ab".into()), &mut short);
        encode_value(&Value::String("abc".into()), &mut long);
        assert!(short < long);
        assert_ne!(short, long[..short.len()]);
    }

    #[test]
    fn non_unique_keys_disambiguate_by_id() {
        let id1 = ObjectId::new();
        let id2 = ObjectId::new();
        let v = Value::Int64(7);
        let k1 = encode_non_unique(&[&v], &id1);
        let k2 = encode_non_unique(&[&v], &id2);
        assert_ne!(k1, k2);
    }

    #[test]
    fn prefix_upper_bound_excludes_longer_strings() {
        let prefix = b"abc".to_vec();
        let upper = prefix_upper_bound(&prefix).unwrap();
        assert!(prefix.as_slice() < upper.as_slice());
        assert!(b"abcz".as_slice() < upper.as_slice());
        assert!(b"abd".as_slice() >= upper.as_slice());
    }
}
