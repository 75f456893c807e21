//! Chooses an index scan vs. a full collection scan for a filter (§4.9).
//!
//! For each candidate index whose leading field appears in the filter,
//! derive a key range from the conjunction of predicates over that
//! field, score the candidate by estimated selectivity, and pick the
//! best. A range that can't be derived (the field only appears under a
//! logical operator, or the index's leading field isn't referenced at
//! all) makes that index unusable; the fallback is a full collection
//! scan, which the executor always re-applies the full filter against
//! regardless (index scans only narrow the candidate set; the residual
//! predicate still runs per §4.9).

use crate::index::{IndexDefinition, IndexKind};
use lauradb_core::key::{encode_compound, prefix_upper_bound};
use serde_json::Value as Json;

/// A derived, half-open byte range over an index's key space.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub low: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    IndexScan { index_name: String, range: KeyRange },
    CollectionScan,
}

/// Estimated selectivity, higher is more selective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Selectivity {
    Unusable,
    Range,
    Equality,
}

/// Choose the best available index plan for `filter` over `indexes`,
/// falling back to a collection scan if none apply.
pub fn choose_plan(filter: &Json, indexes: &[IndexDefinition]) -> Plan {
    let mut best: Option<(Selectivity, Plan)> = None;
    for index in indexes {
        if index.kind != IndexKind::BTree {
            continue;
        }
        let Some(leading) = index.field_paths.first() else { continue };
        let Some((selectivity, range)) = derive_range(filter, leading) else { continue };
        if selectivity == Selectivity::Unusable {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_sel, _)) => selectivity > *best_sel,
        };
        if better {
            best = Some((
                selectivity,
                Plan::IndexScan { index_name: index.name.clone(), range },
            ));
        }
    }
    best.map(|(_, plan)| plan).unwrap_or(Plan::CollectionScan)
}

fn derive_range(filter: &Json, field: &str) -> Option<(Selectivity, KeyRange)> {
    let obj = filter.as_object()?;
    let spec = obj.get(field)?;
    match spec {
        // Equality: {field: scalar}
        Json::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            if let Some(eq) = ops.get("$eq") {
                return Some(equality_range(eq));
            }
            // Anchored-prefix regex lowers to a range scan (§4.5).
            if let Some(Json::String(pattern)) = ops.get("$regex") {
                if let Some(prefix) = anchored_literal_prefix(pattern) {
                    let low = prefix.clone().into_bytes();
                    let high = prefix_upper_bound(&low);
                    return Some((Selectivity::Range, KeyRange { low: Some(low), high }));
                }
            }
            let low = ops.get("$gt").or_else(|| ops.get("$gte")).map(bound_bytes);
            let high = ops.get("$lt").or_else(|| ops.get("$lte")).map(bound_bytes);
            if low.is_some() || high.is_some() {
                Some((Selectivity::Range, KeyRange { low, high }))
            } else {
                None
            }
        }
        // Direct equality: {field: value}
        _ => Some(equality_range(spec)),
    }
}

fn equality_range(value: &Json) -> (Selectivity, KeyRange) {
    let v = crate::json::json_to_value(value).unwrap_or(lauradb_core::Value::Null);
    let low = encode_compound(&[&v]);
    let high = prefix_upper_bound(&low);
    (Selectivity::Equality, KeyRange { low: Some(low), high })
}

fn bound_bytes(value: &Json) -> Vec<u8> {
    let v = crate::json::json_to_value(value).unwrap_or(lauradb_core::Value::Null);
    encode_compound(&[&v])
}

/// Extract a literal prefix from a regex anchored with `^` and
/// containing no further metacharacters in that prefix, e.g. `^abc.*`
/// yields `"abc"`. Returns `None` if the pattern isn't anchored.
fn anchored_literal_prefix(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?;
    let end = body
        .char_indices()
        .find(|(_, c)| "\\^$.|?*+()[]{}".contains(*c))
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    if end == 0 {
        None
    } else {
        Some(body[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn idx(name: &str, field: &str) -> IndexDefinition {
        IndexDefinition::btree(name, vec![field.into()], false)
    }

    #[test]
    fn equality_predicate_derives_equality_plan() {
        let plan = choose_plan(&json!({"name": "Alice"}), &[idx("by_name", "name")]);
        match plan {
            Plan::IndexScan { index_name, .. } => assert_eq!(index_name, "by_name"),
            Plan::CollectionScan => panic!("expected an index scan"),
        }
    }

    #[test]
    fn no_matching_index_falls_back_to_collection_scan() {
        let plan = choose_plan(&json!({"age": 30}), &[idx("by_name", "name")]);
        assert!(matches!(plan, Plan::CollectionScan));
    }

    #[test]
    fn equality_outranks_range_on_a_different_index() {
        let indexes = vec![idx("by_name", "name"), idx("by_age", "age")];
        let plan = choose_plan(&json!({"name": "Alice", "age": {"$gt": 20}}), &indexes);
        match plan {
            Plan::IndexScan { index_name, .. } => assert_eq!(index_name, "by_name"),
            Plan::CollectionScan => panic!("expected an index scan"),
        }
    }

    #[test]
    fn anchored_regex_lowers_to_prefix_range() {
        let plan = choose_plan(&json!({"name": {"$regex": "^Ali"}}), &[idx("by_name", "name")]);
        assert!(matches!(plan, Plan::IndexScan { .. }));
    }
}
