use crate::compare::value_cmp_serialized;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Result};
use serde_json::Value;

/// Collation name referenced by `COLLATE` clauses on key columns.
pub const COLLATION_NAME: &str = "json_order";
/// Scalar `json_field_matches(body, field, op, value)` used by list filters.
pub const FN_FIELD_MATCHES: &str = "json_field_matches";
/// Scalar `pid_contains(pid, id)` matching a serialized pid array.
pub const FN_PID_CONTAINS: &str = "pid_contains";

/// Install the domain collation and scalar functions on a connection.
/// Must run before preparing any statement which references them.
pub fn install(db: &Connection) -> Result<()> {
    db.create_collation(COLLATION_NAME, |lhs, rhs| value_cmp_serialized(lhs, rhs))?;

    db.create_scalar_function(
        FN_FIELD_MATCHES,
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let body: Option<String> = ctx.get(0)?;
            let field: String = ctx.get(1)?;
            let op: String = ctx.get(2)?;
            let needle: String = ctx.get(3)?;
            Ok(field_matches(body.as_deref(), &field, &op, &needle))
        },
    )?;

    db.create_scalar_function(FN_PID_CONTAINS, 2, FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let pid: Option<String> = ctx.get(0)?;
        let id: String = ctx.get(1)?;
        Ok(pid_contains(pid.as_deref(), &id))
    })?;

    Ok(())
}

fn field_matches(body: Option<&str>, field: &str, op: &str, needle: &str) -> bool {
    let Some(body) = body else { return false };
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let member = match parsed.get(field) {
        Some(member) => member,
        None => return false,
    };
    // String members match on their raw text, everything else on its
    // serialized form, so `eq` against "42" matches the number 42.
    let text = match member {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match op {
        "present" => true,
        "eq" => text == needle,
        "contains" => text.contains(needle),
        "starts_with" => text.starts_with(needle),
        _ => false,
    }
}

fn pid_contains(pid: Option<&str>, id: &str) -> bool {
    let Some(pid) = pid else { return false };
    match serde_json::from_str::<Value>(pid) {
        Ok(Value::Array(items)) => items
            .iter()
            .any(|item| item.as_str().map_or(false, |s| s == id)),
        _ => false,
    }
}
