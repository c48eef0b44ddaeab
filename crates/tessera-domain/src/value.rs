//! JSON value ordering and coercion rules shared by every backend.
//!
//! Values are ranked `null > true > false > number > string > other`, with
//! missing fields behaving like `null`. Within a rank, strings compare
//! lexically, numbers numerically and everything else by raw JSON text.

use std::cmp::Ordering;

use serde_json::Value;

/// Parses a query-string value: empty input is `null`, valid JSON is kept
/// as-is, anything else becomes a plain string.
pub fn parse_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 5,
        Some(Value::Bool(true)) => 4,
        Some(Value::Bool(false)) => 3,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 1,
        Some(Value::Array(_) | Value::Object(_)) => 0,
    }
}

/// Total ordering over optional JSON values.
pub fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y)) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => Ordering::Equal,
    }
}

/// Equality used by `EQ`/`IN`: types must match, numbers compare by value.
pub fn is_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.as_f64() == y.as_f64(),
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Truthiness: `true`, non-zero numbers and strings such as `"1"` or `"true"`.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.as_str(), "1" | "t" | "T" | "true" | "TRUE" | "True"),
        _ => false,
    }
}

/// Textual form: strings unquoted, `null` empty, everything else raw JSON.
pub fn to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integer coercion: numbers truncate, numeric strings parse, booleans are
/// 1 or 0, everything else is 0.
pub fn to_int(v: &Value) -> i64 {
    match v {
        Value::Bool(b) => i64::from(*b),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64))
            .unwrap_or_default(),
        _ => 0,
    }
}

/// JSONB-style containment: does `outer` contain `inner`?
pub fn json_contains(outer: &Value, inner: &Value) -> bool {
    match (outer, inner) {
        (Value::Object(o), Value::Object(i)) => i
            .iter()
            .all(|(k, iv)| o.get(k).is_some_and(|ov| json_contains(ov, iv))),
        (Value::Array(o), Value::Array(i)) => i
            .iter()
            .all(|iv| o.iter().any(|ov| json_contains(ov, iv))),
        (Value::Array(o), scalar) if !scalar.is_object() => {
            o.iter().any(|ov| is_equal(Some(ov), Some(scalar)))
        }
        (a, b) => is_equal(Some(a), Some(b)),
    }
}
