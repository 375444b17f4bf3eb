use serde_json::{Number, Value};

/// normalize rewrites a value so that equal values under [`value_cmp`]
/// share one serialized form: floats holding an exact integer collapse to
/// that integer (20.0 becomes 20), recursively through arrays and objects.
/// Object keys need no work; `serde_json`'s map already iterates sorted.
///
/// [`value_cmp`]: crate::value_cmp
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect(),
        ),
        other => other,
    }
}

fn normalize_number(n: Number) -> Number {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && n.as_u64().is_none() {
            if f == 0.0 {
                return Number::from(0);
            }
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
    }
    n
}

/// Canonical text of a normalized value: sorted object keys, integral
/// floats collapsed. This is the form stored in key columns and fed to the
/// content hash, so that textual equality tracks collation equality.
pub fn to_canonical_string(value: &Value) -> String {
    serde_json::to_string(&normalize(value.clone())).unwrap_or_else(|_| "null".to_owned())
}
