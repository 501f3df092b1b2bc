// Record value helpers
//
// Records arrive as JSON-like maps with dynamically typed values (the
// upstream producers are loosely typed). Numeric coercion and loose
// comparison are centralized here so the filter evaluator and the
// accumulator agree on what counts as a number.

use serde_json::Value;
use std::cmp::Ordering;

/// A single ingested record: field name to dynamically typed value.
pub type Record = serde_json::Map<String, Value>;

/// Coerce a value to a float the way loosely typed producers expect:
/// numbers pass through, numeric strings parse, booleans become 0/1.
pub fn as_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Numeric coercion with a zero fallback, used by sum accumulation
/// (non-numeric values contribute nothing, like a loose numeric cast).
pub fn num_or_zero(value: Option<&Value>) -> f64 {
    value.and_then(as_num).unwrap_or(0.0)
}

/// Render a value as the string used for group-by components and
/// distinct-set members. Strings render without quotes; everything
/// else uses its JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loose ordering: numeric when both sides coerce to numbers, string
/// comparison of the rendered forms otherwise.
pub fn loose_cmp(a: &Value, b: &Value) -> Ordering {
    match (as_num(a), as_num(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => value_to_string(a).cmp(&value_to_string(b)),
    }
}

/// Loose equality consistent with [`loose_cmp`].
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    loose_cmp(a, b) == Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_coerce() {
        assert_eq!(as_num(&json!("42")), Some(42.0));
        assert_eq!(as_num(&json!(" 3.5 ")), Some(3.5));
        assert_eq!(as_num(&json!(true)), Some(1.0));
        assert_eq!(as_num(&json!("abc")), None);
        assert_eq!(as_num(&json!(null)), None);
    }

    #[test]
    fn loose_comparison_mixes_types() {
        assert!(loose_eq(&json!(5), &json!("5")));
        assert_eq!(loose_cmp(&json!("10"), &json!(9)), Ordering::Greater);
        assert_eq!(loose_cmp(&json!("abc"), &json!("abd")), Ordering::Less);
    }

    #[test]
    fn group_value_rendering() {
        assert_eq!(value_to_string(&json!("web")), "web");
        assert_eq!(value_to_string(&json!(7)), "7");
        assert_eq!(value_to_string(&json!(null)), "");
    }
}
