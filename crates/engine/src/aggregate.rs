//! Aggregation pipeline (§4.8): `$match`/`$project`/`$sort`/`$limit`/
//! `$skip`/`$group`/`$unwind`/`$lookup` over an already-fetched document
//! stream. Stage ordering is preserved; pushing `$match` down to the
//! planner (when it immediately follows the source) is the caller's
//! job, not this module's — by the time a pipeline reaches here it is
//! pure in-memory dataflow over `Vec<Document>`.

use crate::json::{document_to_json, json_to_document, json_to_value};
use lauradb_core::value::{Document, Value};
use lauradb_core::{Error, Result};
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Looks up every document in a named collection, for `$lookup`'s
/// foreign side. The collection layer supplies this; aggregation itself
/// has no notion of a catalog.
pub trait LookupSource {
    fn documents_in(&self, collection: &str) -> Result<Vec<Document>>;
}

/// Run a pipeline (a JSON array of single-key stage objects) over
/// `input`, returning the transformed document stream.
pub fn run(pipeline: &[Json], input: Vec<Document>, lookups: &dyn LookupSource) -> Result<Vec<Document>> {
    let mut docs = input;
    for stage in pipeline {
        let obj = stage
            .as_object()
            .ok_or_else(|| Error::invalid_argument("aggregation stage must be an object"))?;
        let (name, arg) = obj
            .iter()
            .next()
            .ok_or_else(|| Error::invalid_argument("aggregation stage must have exactly one key"))?;
        docs = match name.as_str() {
            "$match" => {
                let mut out = Vec::with_capacity(docs.len());
                for d in docs {
                    if crate::query::filter::matches(arg, &d)? {
                        out.push(d);
                    }
                }
                out
            }
            "$project" => docs.into_iter().map(|d| project(arg, &d)).collect::<Result<_>>()?,
            "$sort" => {
                sort(&mut docs, arg)?;
                docs
            }
            "$limit" => {
                let n = arg.as_u64().ok_or_else(|| Error::invalid_argument("$limit requires an integer"))? as usize;
                docs.truncate(n);
                docs
            }
            "$skip" => {
                let n = arg.as_u64().ok_or_else(|| Error::invalid_argument("$skip requires an integer"))? as usize;
                docs.into_iter().skip(n).collect()
            }
            "$group" => group(arg, docs)?,
            "$unwind" => unwind(arg, docs)?,
            "$lookup" => lookup(arg, docs, lookups)?,
            other => return Err(Error::unsupported(format!("unknown aggregation stage {other}"))),
        };
    }
    Ok(docs)
}

fn project(spec: &Json, doc: &Document) -> Result<Document> {
    let obj = spec.as_object().ok_or_else(|| Error::invalid_argument("$project requires an object"))?;
    let exclusion_mode = obj.values().all(|v| matches!(v, Json::Bool(false) | Json::Number(_)) && is_zero_or_false(v))
        && !obj.is_empty();
    if exclusion_mode {
        let mut out = doc.clone();
        for field in obj.keys() {
            out.remove_path(field);
        }
        return Ok(out);
    }
    let mut out = Document::new();
    if obj.keys().all(|k| k != "_id") {
        if let Some(id) = doc.get("_id") {
            out.set("_id", id.clone());
        }
    }
    for (field, spec) in obj {
        match spec {
            Json::Bool(true) | Json::Number(_) if is_one_or_true(spec) => {
                if let Some(v) = doc.get_path(field) {
                    out.set_path(field, v.clone());
                }
            }
            Json::Bool(false) => {}
            Json::String(expr) => {
                if let Some(v) = resolve_expr(expr, doc) {
                    out.set_path(field, v);
                }
            }
            other => {
                let v = json_to_value(other)?;
                out.set_path(field, v);
            }
        }
    }
    Ok(out)
}

fn is_one_or_true(v: &Json) -> bool {
    matches!(v, Json::Bool(true)) || v.as_i64() == Some(1)
}

fn is_zero_or_false(v: &Json) -> bool {
    matches!(v, Json::Bool(false)) || v.as_i64() == Some(0)
}

/// Resolve a `$field` reference against a document; returns `None` if
/// `expr` isn't a field reference or the path is absent.
fn resolve_expr(expr: &str, doc: &Document) -> Option<Value> {
    let path = expr.strip_prefix('$')?;
    doc.get_path(path).cloned()
}

fn sort(docs: &mut [Document], spec: &Json) -> Result<()> {
    let obj = spec.as_object().ok_or_else(|| Error::invalid_argument("$sort requires an object"))?;
    let keys: Vec<(String, bool)> = obj
        .iter()
        .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(1) >= 0))
        .collect();
    docs.sort_by(|a, b| {
        for (field, ascending) in &keys {
            let av = a.get_path(field);
            let bv = b.get_path(field);
            let ord = match (av, bv) {
                (Some(x), Some(y)) => x.cmp_value(y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn group_key_value(id_spec: &Json, doc: &Document) -> Result<Value> {
    match id_spec {
        Json::String(expr) => Ok(resolve_expr(expr, doc).unwrap_or(Value::Null)),
        other => json_to_value(other),
    }
}

fn group(spec: &Json, docs: Vec<Document>) -> Result<Vec<Document>> {
    let obj = spec.as_object().ok_or_else(|| Error::invalid_argument("$group requires an object"))?;
    let id_spec = obj.get("_id").ok_or_else(|| Error::invalid_argument("$group requires an _id expression"))?;

    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, (Value, Vec<Document>)> = HashMap::new();
    for doc in docs {
        let key_value = group_key_value(id_spec, &doc)?;
        let key_bytes = {
            let mut buf = Vec::new();
            lauradb_core::key::encode_value(&key_value, &mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        };
        let entry = buckets.entry(key_bytes.clone()).or_insert_with(|| {
            order.push(key_bytes.clone());
            (key_value.clone(), Vec::new())
        });
        entry.1.push(doc);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let (id_value, members) = buckets.remove(&key).expect("key was just inserted");
        let mut result = Document::new();
        result.set("_id", id_value);
        for (field, accumulator) in obj {
            if field == "_id" {
                continue;
            }
            let value = apply_accumulator(accumulator, &members)?;
            result.set(field.clone(), value);
        }
        out.push(result);
    }
    Ok(out)
}

fn apply_accumulator(spec: &Json, members: &[Document]) -> Result<Value> {
    let obj = spec
        .as_object()
        .ok_or_else(|| Error::invalid_argument("group accumulator must be an object"))?;
    let (op, arg) = obj
        .iter()
        .next()
        .ok_or_else(|| Error::invalid_argument("group accumulator must have exactly one key"))?;
    let values = || -> Vec<Value> {
        match arg {
            Json::String(expr) => members.iter().filter_map(|d| resolve_expr(expr, d)).collect(),
            other => {
                let v = json_to_value(other).unwrap_or(Value::Null);
                members.iter().map(|_| v.clone()).collect()
            }
        }
    };
    Ok(match op.as_str() {
        "$sum" => {
            let vs = values();
            if vs.iter().all(|v| matches!(v, Value::Int64(_))) {
                let total: i64 = vs.iter().filter_map(|v| if let Value::Int64(i) = v { Some(*i) } else { None }).sum();
                Value::Int64(total)
            } else {
                let total: f64 = vs.iter().filter_map(|v| v.as_f64()).sum();
                Value::Double(total)
            }
        }
        "$avg" => {
            let vs = values();
            let nums: Vec<f64> = vs.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Double(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "$min" => values().into_iter().min_by(|a, b| a.cmp_value(b).unwrap_or(Ordering::Equal)).unwrap_or(Value::Null),
        "$max" => values().into_iter().max_by(|a, b| a.cmp_value(b).unwrap_or(Ordering::Equal)).unwrap_or(Value::Null),
        "$push" => Value::Array(values()),
        "$addToSet" => {
            let mut out: Vec<Value> = Vec::new();
            for v in values() {
                if !out.iter().any(|o| o.cmp_value(&v) == Some(Ordering::Equal)) {
                    out.push(v);
                }
            }
            Value::Array(out)
        }
        "$count" => Value::Int64(members.len() as i64),
        "$first" => values().into_iter().next().unwrap_or(Value::Null),
        "$last" => values().into_iter().last().unwrap_or(Value::Null),
        other => return Err(Error::unsupported(format!("unknown group accumulator {other}"))),
    })
}

fn unwind(spec: &Json, docs: Vec<Document>) -> Result<Vec<Document>> {
    let path = match spec {
        Json::String(s) => s.strip_prefix('$').unwrap_or(s).to_string(),
        Json::Object(o) => o
            .get("path")
            .and_then(|p| p.as_str())
            .map(|s| s.trim_start_matches('$').to_string())
            .ok_or_else(|| Error::invalid_argument("$unwind object form requires a path"))?,
        _ => return Err(Error::invalid_argument("$unwind requires a field path")),
    };
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match doc.get_path(&path) {
            Some(Value::Array(items)) => {
                for item in items.clone() {
                    let mut d = doc.clone();
                    d.set_path(&path, item);
                    out.push(d);
                }
            }
            _ => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup(spec: &Json, docs: Vec<Document>, lookups: &dyn LookupSource) -> Result<Vec<Document>> {
    let obj = spec.as_object().ok_or_else(|| Error::invalid_argument("$lookup requires an object"))?;
    let from = obj.get("from").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid_argument("$lookup requires from"))?;
    let local_field = obj.get("localField").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid_argument("$lookup requires localField"))?;
    let foreign_field = obj.get("foreignField").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid_argument("$lookup requires foreignField"))?;
    let as_field = obj.get("as").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid_argument("$lookup requires as"))?;

    let foreign_docs = lookups.documents_in(from)?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let local_value = doc.get_path(local_field).cloned();
        let matched: Vec<Json> = foreign_docs
            .iter()
            .filter(|f| {
                let fv = f.get_path(foreign_field);
                match (&local_value, fv) {
                    (Some(l), Some(r)) => l.cmp_value(r) == Some(Ordering::Equal),
                    _ => false,
                }
            })
            .map(document_to_json)
            .collect();
        let mut d = doc;
        let joined = Json::Array(matched);
        let joined_doc = json_to_document(&wrap_array(as_field, joined))?;
        if let Some(v) = joined_doc.get(as_field) {
            d.set(as_field, v.clone());
        }
        out.push(d);
    }
    Ok(out)
}

fn wrap_array(field: &str, array: Json) -> Json {
    let mut m = Map::new();
    m.insert(field.to_string(), array);
    Json::Object(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoLookups;
    impl LookupSource for NoLookups {
        fn documents_in(&self, _collection: &str) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
    }

    fn doc(j: Json) -> Document {
        json_to_document(&j).unwrap()
    }

    #[test]
    fn group_by_category_sums_values() {
        let docs = vec![
            doc(json!({"cat": "a", "v": 1})),
            doc(json!({"cat": "a", "v": 3})),
            doc(json!({"cat": "b", "v": 5})),
        ];
        let pipeline = vec![json!({"$group": {"_id": "$cat", "s": {"$sum": "$v"}}})];
        let mut out = run(&pipeline, docs, &NoLookups).unwrap();
        out.sort_by_key(|d| d.get("_id").map(|v| format!("{v:?}")));
        assert_eq!(out.len(), 2);
        let a = out.iter().find(|d| d.get("_id") == Some(&Value::String("a".into()))).unwrap();
        assert_eq!(a.get("s"), Some(&Value::Int64(4)));
        let b = out.iter().find(|d| d.get("_id") == Some(&Value::String("b".into()))).unwrap();
        assert_eq!(b.get("s"), Some(&Value::Int64(5)));
    }

    #[test]
    fn match_then_sort_then_limit() {
        let docs = vec![doc(json!({"n": 3})), doc(json!({"n": 1})), doc(json!({"n": 2}))];
        let pipeline = vec![
            json!({"$match": {"n": {"$gt": 0}}}),
            json!({"$sort": {"n": 1}}),
            json!({"$limit": 2}),
        ];
        let out = run(&pipeline, docs, &NoLookups).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("n"), Some(&Value::Int64(1)));
        assert_eq!(out[1].get("n"), Some(&Value::Int64(2)));
    }

    #[test]
    fn unwind_expands_array_field() {
        let docs = vec![doc(json!({"tags": ["a", "b"]}))];
        let pipeline = vec![json!({"$unwind": "$tags"})];
        let out = run(&pipeline, docs, &NoLookups).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn project_inclusion_keeps_id_and_named_fields() {
        let mut d = doc(json!({"name": "Alice", "age": 30}));
        d.set("_id", Value::Int64(1));
        let pipeline = vec![json!({"$project": {"name": 1}})];
        let out = run(&pipeline, vec![d], &NoLookups).unwrap();
        assert_eq!(out[0].get("name"), Some(&Value::String("Alice".into())));
        assert_eq!(out[0].get("age"), None);
        assert_eq!(out[0].get("_id"), Some(&Value::Int64(1)));
    }
}
