//! Filter operator language (§4.8): comparison, logical, element, array,
//! and geospatial operators over dot-path fields.

use crate::index::geo;
use crate::json::json_to_value;
use lauradb_core::value::{Document, Value};
use lauradb_core::{Error, Result};
use regex::Regex;
use serde_json::Value as Json;
use std::cmp::Ordering;

/// Evaluate a filter spec (a JSON object per §4.8) against `doc`.
pub fn matches(filter: &Json, doc: &Document) -> Result<bool> {
    let obj = match filter {
        Json::Object(m) => m,
        _ => return Err(Error::invalid_argument("filter must be a JSON object")),
    };
    for (key, value) in obj {
        let ok = match key.as_str() {
            "$and" => as_array(value, "$and")?.iter().try_fold(true, |acc, f| {
                Ok::<_, Error>(acc && matches(f, doc)?)
            })?,
            "$or" => {
                let mut any = false;
                for f in as_array(value, "$or")? {
                    if matches(f, doc)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut any = false;
                for f in as_array(value, "$nor")? {
                    if matches(f, doc)? {
                        any = true;
                        break;
                    }
                }
                !any
            }
            "$not" => !matches(value, doc)?,
            _ => match_field(key, value, doc)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_array<'a>(v: &'a Json, op: &str) -> Result<&'a Vec<Json>> {
    v.as_array()
        .ok_or_else(|| Error::invalid_argument(format!("{op} requires an array of filters")))
}

/// Every value a dotted field path resolves to. Array segments match if
/// *any* element matches, per §4.8; this returns all of them so the
/// caller can apply that "any" semantics uniformly. A path through an
/// array without a further array-index segment is also expanded this
/// way (implicit array traversal).
fn resolve_path_values<'a>(doc: &'a Document, path: &str) -> Vec<Option<&'a Value>> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return vec![None];
    };
    let mut current: Vec<Option<&Value>> = vec![doc.get(first)];
    for seg in segments {
        let mut next = Vec::new();
        for v in current {
            match v {
                Some(Value::Document(d)) => next.push(d.get(seg)),
                Some(Value::Array(items)) => {
                    if let Ok(idx) = seg.parse::<usize>() {
                        next.push(items.get(idx));
                    } else {
                        for item in items {
                            match item {
                                Value::Document(d) => next.push(d.get(seg)),
                                _ => next.push(None),
                            }
                        }
                    }
                }
                _ => next.push(None),
            }
        }
        current = next;
    }
    current
}

fn match_field(path: &str, spec: &Json, doc: &Document) -> Result<bool> {
    let values = resolve_path_values(doc, path);
    // $elemMatch forces single-element conjunction against one array
    // element; it must see the whole array, not the expanded values.
    if let Json::Object(m) = spec {
        if let Some(elem_spec) = m.get("$elemMatch") {
            let array_val = doc.get_path(path);
            return Ok(match array_val {
                Some(Value::Array(items)) => items.iter().any(|item| elem_matches(elem_spec, item)),
                _ => false,
            });
        }
        if m.keys().all(|k| k.starts_with('$')) {
            for (op, arg) in m {
                if !eval_operator_any(op, arg, &values)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    // Plain equality (implicit $eq), possibly against an array field.
    let target = json_to_value(spec)?;
    Ok(values.iter().any(|v| value_eq(v.copied(), &target)))
}

fn elem_matches(spec: &Json, item: &Value) -> bool {
    match spec {
        Json::Object(m) if m.keys().all(|k| k.starts_with('$')) => m
            .iter()
            .all(|(op, arg)| eval_operator(op, arg, Some(item)).unwrap_or(false)),
        _ => {
            if let Value::Document(d) = item {
                matches(spec, d).unwrap_or(false)
            } else {
                false
            }
        }
    }
}

fn eval_operator_any(op: &str, arg: &Json, values: &[Option<&Value>]) -> Result<bool> {
    if values.is_empty() {
        return eval_operator(op, arg, None);
    }
    for v in values {
        if eval_operator(op, arg, *v)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn value_eq(v: Option<&Value>, target: &Value) -> bool {
    match v {
        Some(v) => v.cmp_value(target) == Some(Ordering::Equal),
        None => matches!(target, Value::Null),
    }
}

fn eval_operator(op: &str, arg: &Json, v: Option<&Value>) -> Result<bool> {
    Ok(match op {
        "$eq" => value_eq(v, &json_to_value(arg)?),
        "$ne" => !value_eq(v, &json_to_value(arg)?),
        "$gt" => cmp_against(v, arg)? == Some(Ordering::Greater),
        "$gte" => matches!(cmp_against(v, arg)?, Some(Ordering::Greater) | Some(Ordering::Equal)),
        "$lt" => cmp_against(v, arg)? == Some(Ordering::Less),
        "$lte" => matches!(cmp_against(v, arg)?, Some(Ordering::Less) | Some(Ordering::Equal)),
        "$in" => {
            let targets = as_array(arg, "$in")?;
            targets.iter().any(|t| {
                json_to_value(t).map(|t| value_eq(v, &t)).unwrap_or(false)
            })
        }
        "$nin" => {
            let targets = as_array(arg, "$nin")?;
            !targets.iter().any(|t| {
                json_to_value(t).map(|t| value_eq(v, &t)).unwrap_or(false)
            })
        }
        "$exists" => {
            let want = arg.as_bool().unwrap_or(true);
            v.is_some() == want
        }
        "$type" => {
            let want = arg.as_str().unwrap_or("");
            v.map(|v| v.type_tag().to_string() == want).unwrap_or(false)
        }
        "$regex" => {
            let pattern = arg.as_str().ok_or_else(|| Error::invalid_argument("$regex requires a string"))?;
            let re = Regex::new(pattern).map_err(|e| Error::invalid_argument(format!("bad regex: {e}")))?;
            matches!(v, Some(Value::String(s)) if re.is_match(s))
        }
        "$size" => {
            let want = arg.as_u64().ok_or_else(|| Error::invalid_argument("$size requires an integer"))?;
            matches!(v, Some(Value::Array(a)) if a.len() as u64 == want)
        }
        "$all" => {
            let wanted = as_array(arg, "$all")?;
            match v {
                Some(Value::Array(items)) => wanted.iter().all(|w| {
                    json_to_value(w)
                        .map(|w| items.iter().any(|i| i.cmp_value(&w) == Some(Ordering::Equal)))
                        .unwrap_or(false)
                }),
                _ => false,
            }
        }
        "$near" => eval_near(arg, v)?,
        "$geoWithin" => eval_geo_within(arg, v)?,
        "$elemMatch" => match v {
            Some(Value::Array(items)) => items.iter().any(|i| elem_matches(arg, i)),
            _ => false,
        },
        other => return Err(Error::unsupported(format!("unknown filter operator {other}"))),
    })
}

fn cmp_against(v: Option<&Value>, arg: &Json) -> Result<Option<Ordering>> {
    let target = json_to_value(arg)?;
    Ok(v.and_then(|v| v.cmp_value(&target)))
}

fn as_point(v: &Value) -> Option<(f64, f64)> {
    match v {
        Value::Array(a) if a.len() == 2 => Some((a[0].as_f64()?, a[1].as_f64()?)),
        Value::Document(d) => Some((d.get("lng")?.as_f64()?, d.get("lat")?.as_f64()?)),
        _ => None,
    }
}

fn eval_near(arg: &Json, v: Option<&Value>) -> Result<bool> {
    let obj = arg.as_object().ok_or_else(|| Error::invalid_argument("$near requires an object"))?;
    let center = obj
        .get("$center")
        .and_then(|c| json_to_value(c).ok())
        .and_then(|c| as_point(&c))
        .ok_or_else(|| Error::invalid_argument("$near requires $center: [lng, lat]"))?;
    let max_distance = obj.get("$maxDistance").and_then(|d| d.as_f64()).unwrap_or(f64::MAX);
    let sphere = obj.get("$sphere").and_then(|s| s.as_bool()).unwrap_or(true);
    let Some(point) = v.and_then(as_point) else {
        return Ok(false);
    };
    let dist = if sphere {
        geo::haversine_meters(point, center)
    } else {
        geo::euclidean(point, center)
    };
    Ok(dist <= max_distance)
}

fn eval_geo_within(arg: &Json, v: Option<&Value>) -> Result<bool> {
    let obj = arg.as_object().ok_or_else(|| Error::invalid_argument("$geoWithin requires an object"))?;
    let polygon_json = obj
        .get("$polygon")
        .ok_or_else(|| Error::invalid_argument("$geoWithin requires $polygon"))?;
    let polygon_val = json_to_value(polygon_json)?;
    let polygon: Vec<(f64, f64)> = match polygon_val {
        Value::Array(items) => items.iter().filter_map(as_point).collect(),
        _ => return Err(Error::invalid_argument("$polygon must be an array of points")),
    };
    let Some(point) = v.and_then(as_point) else {
        return Ok(false);
    };
    Ok(geo::point_in_polygon(point, &polygon))
}

/// Report the set of top-level field paths a filter references, used by
/// the planner to find candidate indexes (§4.9). Only looks at
/// direct-equality and comparison fields; logical operators recurse.
pub fn referenced_fields(filter: &Json) -> Vec<String> {
    let mut out = Vec::new();
    collect_fields(filter, &mut out);
    out
}

fn collect_fields(filter: &Json, out: &mut Vec<String>) {
    let Json::Object(m) = filter else { return };
    for (k, v) in m {
        match k.as_str() {
            "$and" | "$or" | "$nor" => {
                if let Json::Array(items) = v {
                    for f in items {
                        collect_fields(f, out);
                    }
                }
            }
            "$not" => collect_fields(v, out),
            _ => out.push(k.clone()),
        }
    }
}
