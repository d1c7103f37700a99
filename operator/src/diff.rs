//! Semantic "desired is a subset of observed" comparison.
//!
//! The API server defaults plenty of fields the operator never sets
//! (`progressDeadlineSeconds`, `clusterIP`, `terminationMessagePath`, ...).
//! Comparing whole objects would report a difference on every pass, so only
//! the fields present on the desired side are checked.

use serde::Serialize;
use serde_json::Value;

use crate::quantity;

/// True when a field set on `desired` differs from `observed`.
pub fn needs_update<T: Serialize>(desired: &T, observed: &T) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(observed)) {
        (Ok(desired), Ok(observed)) => !is_derivative(&desired, &observed, false),
        // Unserializable specs can't be compared; push them through.
        _ => true,
    }
}

/// True when every field set in `desired` matches `observed`.
///
/// Unset means absent, `null`, an empty string, an empty list or an empty map.
/// A desired list matches when its elements match the leading elements of the
/// observed list; extra observed entries (injected sidecars, env) are ignored.
/// Inside `limits`/`requests` maps strings are
/// compared as resource quantities.
pub fn is_derivative(desired: &Value, observed: &Value, quantities: bool) -> bool {
    match (desired, observed) {
        (Value::Null, _) => true,
        (Value::String(d), _) if d.is_empty() => true,
        (Value::Array(d), _) if d.is_empty() => true,
        (Value::Object(d), _) if d.is_empty() => true,

        (Value::Object(d), Value::Object(o)) => d.iter().all(|(key, dv)| {
            let quantities = quantities || key == "limits" || key == "requests";
            match o.get(key) {
                Some(ov) => is_derivative(dv, ov, quantities),
                None => is_unset(dv),
            }
        }),
        (Value::Array(d), Value::Array(o)) => {
            d.len() <= o.len()
                && d.iter()
                    .zip(o)
                    .all(|(dv, ov)| is_derivative(dv, ov, quantities))
        }
        (Value::String(d), Value::String(o)) if quantities => {
            d == o || quantity::same_amount(d, o)
        }
        (Value::Number(d), Value::String(o)) | (Value::String(o), Value::Number(d))
            if quantities =>
        {
            quantity::same_amount(&d.to_string(), o)
        }
        (d, o) => d == o,
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.values().all(is_unset),
        _ => false,
    }
}
