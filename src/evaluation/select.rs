//! Selecting values out of an evaluation target and coercing them to strings.
use std::{borrow::Cow, collections::HashMap};

use serde_json::{Map, Value};

use super::models::Variant;

/// What conditions and buckets select from: the user/group context and the results of flags
/// evaluated so far.
pub(crate) struct Target<'a> {
    pub context: &'a Value,
    pub results: &'a HashMap<String, Variant>,
}

impl Target<'_> {
    /// Walk `selector` into the target. Missing keys and JSON nulls select nothing.
    pub fn select(&self, selector: &[String]) -> Option<Cow<'_, Value>> {
        let (root, path) = selector.split_first()?;
        match root.as_str() {
            "context" => select_value(self.context, path).map(Cow::Borrowed),
            "result" => {
                let Some((flag_key, path)) = path.split_first() else {
                    return serde_json::to_value(self.results).ok().map(Cow::Owned);
                };
                select_variant(self.results.get(flag_key)?, path)
            }
            _ => None,
        }
    }
}

fn select_variant<'a>(variant: &'a Variant, path: &[String]) -> Option<Cow<'a, Value>> {
    let Some((field, path)) = path.split_first() else {
        return serde_json::to_value(variant).ok().map(Cow::Owned);
    };
    match field.as_str() {
        "key" if path.is_empty() => Some(Cow::Owned(Value::String(variant.key.clone()))),
        "value" => select_value(variant.value.as_ref()?, path).map(Cow::Borrowed),
        "payload" => select_value(variant.payload.as_ref()?, path).map(Cow::Borrowed),
        "metadata" => select_map(variant.metadata.as_ref()?, path),
        _ => None,
    }
}

fn select_map<'a>(map: &'a Map<String, Value>, path: &[String]) -> Option<Cow<'a, Value>> {
    match path.split_first() {
        None => Some(Cow::Owned(Value::Object(map.clone()))),
        Some((key, path)) => select_value(map.get(key)?, path).map(Cow::Borrowed),
    }
}

fn select_value<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for key in path {
        value = value.as_object()?.get(key)?;
    }
    (!value.is_null()).then_some(value)
}

/// String form of a value as compared by string operators. Arrays and objects are serialized as
/// JSON.
pub(crate) fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(format_number(n)),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

/// List form of a value as compared by set operators. Non-array values are parsed as a JSON array
/// of strings.
pub(crate) fn coerce_string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(values) => Some(values.iter().filter_map(coerce_string).collect()),
        _ => serde_json::from_str(&coerce_string(value)?).ok(),
    }
}

/// Shortest representation, switching to an exponent below `1e-4` and from `1e21` on, so
/// `1.0` matches the filter value "1" and `1e21` matches "1e+21".
fn format_number(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    let Some(f) = n.as_f64() else {
        return n.to_string();
    };
    let scientific = format!("{f:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return f.to_string();
    };
    match exponent.parse::<i32>() {
        Ok(exponent) if !(-4..21).contains(&exponent) => {
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        _ => f.to_string(),
    }
}
