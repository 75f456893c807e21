//! JSON projection of the document model (§4.6, §6): used by the
//! filter/update operator language, aggregation, and backup/restore.
//! Not the on-disk format — [`lauradb_storage::doccodec`] owns that.
//!
//! Extended-JSON style tags disambiguate types JSON can't express
//! natively: `{"$oid": "<24 hex>"}`, `{"$timestamp": <i64 millis>}`,
//! `{"$binary": "<base64>"}`.

use base64::{engine::general_purpose::STANDARD, Engine};
use lauradb_core::{Document, ObjectId, Value};
use serde_json::{Map, Number};

/// Convert a document into its JSON projection.
pub fn document_to_json(doc: &Document) -> serde_json::Value {
    let mut map = Map::new();
    for (k, v) in doc.iter() {
        map.insert(k.clone(), value_to_json(v));
    }
    serde_json::Value::Object(map)
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int64(i) => serde_json::Value::Number(Number::from(*i)),
        Value::Double(d) => Number::from_f64(*d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            let mut m = Map::new();
            m.insert("$binary".into(), serde_json::Value::String(STANDARD.encode(b)));
            serde_json::Value::Object(m)
        }
        Value::Timestamp(ts) => {
            let mut m = Map::new();
            m.insert("$timestamp".into(), serde_json::Value::Number(Number::from(*ts)));
            serde_json::Value::Object(m)
        }
        Value::ObjectId(id) => {
            let mut m = Map::new();
            m.insert("$oid".into(), serde_json::Value::String(id.to_string()));
            serde_json::Value::Object(m)
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Document(d) => document_to_json(d),
    }
}

/// Parse a document's JSON projection back into the document model.
pub fn json_to_document(json: &serde_json::Value) -> lauradb_core::Result<Document> {
    match json_to_value(json)? {
        Value::Document(d) => Ok(d),
        _ => Err(lauradb_core::Error::invalid_argument(
            "expected a JSON object at document root",
        )),
    }
}

pub fn json_to_value(json: &serde_json::Value) -> lauradb_core::Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int64(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect::<lauradb_core::Result<_>>()?)
        }
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(hex)) = map.get("$oid") {
                return Ok(Value::ObjectId(
                    ObjectId::parse(hex).map_err(lauradb_core::Error::invalid_argument)?,
                ));
            }
            if let Some(serde_json::Value::Number(ts)) = map.get("$timestamp") {
                return Ok(Value::Timestamp(ts.as_i64().unwrap_or(0)));
            }
            if let Some(serde_json::Value::String(b64)) = map.get("$binary") {
                let bytes = STANDARD
                    .decode(b64)
                    .map_err(|e| lauradb_core::Error::invalid_argument(format!("bad $binary: {e}")))?;
                return Ok(Value::Bytes(bytes));
            }
            let mut doc = Document::new();
            for (k, v) in map {
                doc.set(k.clone(), json_to_value(v)?);
            }
            Value::Document(doc)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_round_trips_through_extended_json() {
        let id = ObjectId::new();
        let doc = {
            let mut d = Document::new();
            d.set("_id", Value::ObjectId(id));
            d
        };
        let json = document_to_json(&doc);
        let back = json_to_document(&json).unwrap();
        assert_eq!(back.get("_id"), Some(&Value::ObjectId(id)));
    }

    #[test]
    fn nested_arrays_and_documents_round_trip() {
        let mut doc = Document::new();
        doc.set("tags", Value::Array(vec![Value::String("a".into()), Value::Int64(1)]));
        let json = document_to_json(&doc);
        let back = json_to_document(&json).unwrap();
        assert_eq!(back, doc);
    }
}
