use itertools::{EitherOrBoth, Itertools};
use serde_json::Value;
use std::cmp::Ordering;

/// value_cmp evaluates the deep ordering of |lhs| and |rhs| under the
/// domain collation: null < false < true < number < string < array < object.
/// Arrays compare elementwise, objects compare property-then-value in the
/// natural (sorted) property order, and shorter sequences order first.
pub fn value_cmp(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(lhs), Value::Bool(rhs)) => lhs.cmp(rhs),
        (Value::Number(lhs), Value::Number(rhs)) => number_cmp(lhs, rhs),
        (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
        (Value::Array(lhs), Value::Array(rhs)) => lhs
            .iter()
            .zip_longest(rhs)
            .map(|eob| match eob {
                EitherOrBoth::Both(lhs, rhs) => value_cmp(lhs, rhs),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Value::Object(lhs), Value::Object(rhs)) => lhs
            .iter()
            .zip_longest(rhs)
            .map(|eob| match eob {
                EitherOrBoth::Both((lhs_p, lhs_v), (rhs_p, rhs_v)) => {
                    match lhs_p.cmp(rhs_p) {
                        Ordering::Equal => value_cmp(lhs_v, rhs_v),
                        unequal => unequal,
                    }
                }
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),

        // Mixed types order by type rank.
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(_), _) => Ordering::Less,
        (_, Value::Bool(_)) => Ordering::Greater,
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::String(_), _) => Ordering::Less,
        (_, Value::String(_)) => Ordering::Greater,
        (Value::Array(_), _) => Ordering::Less,
        (_, Value::Array(_)) => Ordering::Greater,
    }
}

/// value_cmp_serialized orders two serialized JSON texts, as stored in a
/// view's key column. Texts which fail to parse order after every valid
/// value and fall back to byte order among themselves, so the ordering
/// stays total for SQLite's purposes.
pub fn value_cmp_serialized(lhs: &str, rhs: &str) -> Ordering {
    match (
        serde_json::from_str::<Value>(lhs),
        serde_json::from_str::<Value>(rhs),
    ) {
        (Ok(lhs), Ok(rhs)) => value_cmp(&lhs, &rhs),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => lhs.cmp(rhs),
    }
}

// serde_json::Number is one of u64, i64, or f64. Compare across all three
// representations without losing the integer cases that f64 can't hold.
fn number_cmp(lhs: &serde_json::Number, rhs: &serde_json::Number) -> Ordering {
    if let (Some(l), Some(r)) = (lhs.as_u64(), rhs.as_u64()) {
        return l.cmp(&r);
    }
    if let (Some(l), Some(r)) = (lhs.as_i64(), rhs.as_i64()) {
        return l.cmp(&r);
    }
    // A u64 beyond i64::MAX against any i64 is always greater, and vice versa.
    if lhs.as_u64().is_some() && rhs.as_i64().is_some() {
        return Ordering::Greater;
    }
    if lhs.as_i64().is_some() && rhs.as_u64().is_some() {
        return Ordering::Less;
    }
    let l = lhs.as_f64().unwrap_or(f64::NAN);
    let r = rhs.as_f64().unwrap_or(f64::NAN);
    // NaN never round-trips through serde_json; treat it as the smallest number.
    l.partial_cmp(&r).unwrap_or_else(|| {
        if l.is_nan() && r.is_nan() {
            Ordering::Equal
        } else if l.is_nan() {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    })
}

#[cfg(test)]
mod test {
    use super::{value_cmp, value_cmp_serialized};
    use serde_json::{json, Value};
    use std::cmp::Ordering;

    fn is_lt(lhs: Value, rhs: Value) {
        assert_eq!(value_cmp(&lhs, &rhs), Ordering::Less);
        assert_eq!(value_cmp(&rhs, &lhs), Ordering::Greater);
    }
    fn is_eq(lhs: Value, rhs: Value) {
        assert_eq!(value_cmp(&lhs, &rhs), Ordering::Equal);
        assert_eq!(value_cmp(&rhs, &lhs), Ordering::Equal);
    }

    #[test]
    fn scalar_ordering() {
        is_eq(Value::Null, Value::Null);
        is_lt(Value::Null, json!(false));
        is_lt(json!(false), json!(true));
        is_lt(json!(true), json!(0));
        is_lt(json!(99), json!("a"));
        is_lt(json!("z"), json!([]));
        is_lt(json!([1, 2, 3]), json!({}));
    }

    #[test]
    fn number_ordering() {
        is_eq(json!(10), json!(10.0));
        is_eq(json!(-3), json!(-3.0));
        is_lt(json!(-1), json!(1));
        is_lt(json!(1.5), json!(2));
        is_lt(json!(i64::MIN), json!(u64::MAX));
        is_lt(json!(i64::MAX), json!(u64::MAX));
    }

    #[test]
    fn string_ordering() {
        is_eq(json!("foo"), json!("foo"));
        is_lt(json!(""), json!("a"));
        is_lt(json!("a"), json!("aa"));
        is_lt(json!("a"), json!("b"));
    }

    #[test]
    fn array_ordering() {
        is_eq(json!([1, "two"]), json!([1, "two"]));
        is_lt(json!([]), json!([null]));
        is_lt(json!([1, 2]), json!([1, 2, 3]));
        is_lt(json!([1, 2, 3]), json!([1, 3]));
        is_lt(json!([1, 2]), json!([1, "2"]));
    }

    #[test]
    fn object_ordering() {
        is_eq(json!({"a": 1, "b": 2}), json!({"b": 2, "a": 1}));
        is_lt(json!({}), json!({"a": null}));
        is_lt(json!({"a": 1}), json!({"a": 2}));
        is_lt(json!({"a": 1}), json!({"b": 0}));
        is_lt(json!({"a": 1}), json!({"a": 1, "b": 0}));
    }

    #[test]
    fn serialized_ordering_is_total() {
        assert_eq!(value_cmp_serialized("1", "2"), Ordering::Less);
        assert_eq!(value_cmp_serialized("\"a\"", "\"a\""), Ordering::Equal);
        // Garbage orders after valid values, deterministically.
        assert_eq!(value_cmp_serialized("1", "not json"), Ordering::Less);
        assert_eq!(value_cmp_serialized("not json", "{}"), Ordering::Greater);
        assert_eq!(value_cmp_serialized("@@", "@@"), Ordering::Equal);
    }

    #[test]
    fn transitivity_over_mixed_sample() {
        let sample = vec![
            Value::Null,
            json!(false),
            json!(true),
            json!(-7),
            json!(0),
            json!(1.5),
            json!(u64::MAX),
            json!(""),
            json!("abc"),
            json!([]),
            json!([1]),
            json!({}),
            json!({"k": 1}),
        ];
        for a in &sample {
            for b in &sample {
                for c in &sample {
                    if value_cmp(a, b) != Ordering::Greater
                        && value_cmp(b, c) != Ordering::Greater
                    {
                        assert_ne!(value_cmp(a, c), Ordering::Greater, "{a} {b} {c}");
                    }
                }
            }
        }
    }
}
