//! Field extraction helpers for client-supplied JSON payloads.

use crate::domain::error::BlocktraderError;
use serde_json::{Map, Value};

/// Opaque key/value parameters attached to blocks, conditions and actions.
pub type Parameters = Map<String, Value>;

/// Treats an explicit JSON `null` the same as an absent field.
pub fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

pub fn required_text(
    value: Option<&Value>,
    current: Option<&str>,
    field: &str,
) -> Result<String, BlocktraderError> {
    match present(value) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(BlocktraderError::invalid(field, "must not be blank")),
        Some(_) => Err(BlocktraderError::invalid(field, "must be a string")),
        None => current
            .map(str::to_string)
            .ok_or_else(|| BlocktraderError::invalid(field, "is required")),
    }
}

/// Accepts a JSON number or numeric text; rejects non-finite values.
pub fn number(value: &Value, field: &str) -> Result<f64, BlocktraderError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(BlocktraderError::invalid(field, "must be a finite number")),
    }
}

pub fn parameters(
    value: Option<&Value>,
    current: Option<&Parameters>,
    field: &str,
) -> Result<Parameters, BlocktraderError> {
    match present(value) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(BlocktraderError::invalid(field, "must be an object")),
        None => Ok(current.cloned().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_counts_as_absent() {
        let null = json!(null);
        assert!(present(Some(&null)).is_none());
        assert_eq!(
            required_text(Some(&null), Some("kept"), "symbol").unwrap(),
            "kept"
        );
    }

    #[test]
    fn text_is_trimmed() {
        let v = json!("  AAPL ");
        assert_eq!(required_text(Some(&v), None, "symbol").unwrap(), "AAPL");
    }

    #[test]
    fn wrong_type_names_field() {
        let v = json!(12);
        match required_text(Some(&v), None, "symbol") {
            Err(BlocktraderError::InvalidPayload { field, reason }) => {
                assert_eq!(field, "symbol");
                assert_eq!(reason, "must be a string");
            }
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn numbers_and_numeric_text() {
        assert_eq!(number(&json!(3), "x").unwrap(), 3.0);
        assert_eq!(number(&json!("2.5"), "x").unwrap(), 2.5);
        assert!(number(&json!("abc"), "x").is_err());
        assert!(number(&json!(true), "x").is_err());
    }

    #[test]
    fn parameters_must_be_object() {
        assert!(parameters(Some(&json!([1, 2])), None, "parameters").is_err());
        let mut current = Parameters::new();
        current.insert("k".into(), json!(1));
        assert_eq!(parameters(None, Some(&current), "parameters").unwrap(), current);
    }
}
