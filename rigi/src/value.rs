use serde_json::{Map, Value};

/// Free-form message payload. Channel handlers define which keys are
/// required; everything else travels through untouched. Key order is
/// preserved so republished payloads stay byte-comparable.
pub type Payload = Map<String, Value>;

/// Looks up a numeric field, accepting both integer and float encodings.
pub fn get_f64(payload: &Payload, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

pub fn get_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

pub fn get_bool(payload: &Payload, key: &str) -> Option<bool> {
    payload.get(key).and_then(Value::as_bool)
}

/// Converts a float into a JSON value, mapping non-finite values to null.
/// `serde_json` has no representation for NaN/Infinity, and outbound
/// consumers must never receive them.
pub fn finite_number(value: f64) -> Value {
    if value.is_finite() {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else {
        Value::Null
    }
}

/// Recursively replaces non-finite numbers with null. Payloads built from
/// `Payload` literals cannot contain them, but values assembled through
/// `serde_json::json!` from sensor floats can.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, sanitize(v))).collect())
        }
        other => other,
    }
}
