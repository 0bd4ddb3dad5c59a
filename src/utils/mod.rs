pub mod validation;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Total order over JSON scalars used wherever results must be ordered the
/// same way regardless of backend: null < bool < number < string < other.
pub fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }
    match (a, b) {
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => match rank(a).cmp(&rank(b)) {
            Ordering::Equal => a.to_string().cmp(&b.to_string()),
            other => other,
        },
    }
}

/// Typed equality between two JSON scalars; numbers compare numerically.
pub fn json_scalar_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Text form of an attribute used as a grouping key.
pub fn dimension_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON number from an f64, `null` for non-finite values.
pub fn f64_to_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Timestamps are stored and compared at millisecond precision, the finest
/// every backend keeps.
pub fn truncate_to_millis(ts: &DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

pub fn timestamp_to_json(ts: &DateTime<Utc>) -> JsonValue {
    JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compare_json_orders_mixed_scalars() {
        let mut values = vec![json!("b"), json!(3), json!(null), json!("a"), json!(1.5), json!(true)];
        values.sort_by(compare_json);
        assert_eq!(values, vec![json!(null), json!(true), json!(1.5), json!(3), json!("a"), json!("b")]);
    }

    #[test]
    fn test_scalar_eq_is_typed() {
        assert!(json_scalar_eq(&json!(1), &json!(1.0)));
        assert!(!json_scalar_eq(&json!("1"), &json!(1)));
        assert!(json_scalar_eq(&json!("A"), &json!("A")));
    }

    #[test]
    fn test_dimension_text() {
        assert_eq!(dimension_text(&json!("A")), "A");
        assert_eq!(dimension_text(&json!(2024)), "2024");
        assert_eq!(dimension_text(&json!(null)), "");
    }
}
