//! Loose truthiness over JSON values.

use serde_json::Value;

/// Reports whether a JSON value is "truthy" under loose-typing rules:
/// `null`, `false`, `0`, `0.0`, and `""` are falsy; everything else
/// (including empty arrays and objects) is truthy.
///
/// This is the default error predicate of the retry plugin: any non-empty
/// payload counts as an error condition until a caller supplies a predicate
/// that understands its response shape.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
