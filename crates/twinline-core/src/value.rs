// ── Resource values ──
//
// Values travel as `serde_json::Value`. A resource declares a
// `ValueKind`; incoming values are coerced to it before they land in
// the twin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use strum::{Display, EnumString};

use crate::error::CoreError;

/// Declared type of a resource value.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ValueKind {
    Boolean,
    Integer,
    Float,
    String,
    #[default]
    Any,
}

impl ValueKind {
    /// Kind a fresh resource gets when the first value it sees is `value`.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Null | Value::Array(_) | Value::Object(_) => Self::Any,
        }
    }

    /// Convert `value` to this kind. `null` is accepted by every kind.
    pub fn coerce(self, value: Value) -> Result<Value, CoreError> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Self::Any, v)
            | (Self::Boolean, v @ Value::Bool(_))
            | (Self::String, v @ Value::String(_)) => Ok(v),
            (Self::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(self.reject(&Value::Number(n))),
            },
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(self.reject(&Value::String(s))),
            },
            (Self::Integer, Value::Number(n)) => integer_from_number(&n)
                .map(Value::Number)
                .ok_or_else(|| self.reject(&Value::Number(n))),
            (Self::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| self.reject(&Value::String(s))),
            (Self::Integer, Value::Bool(b)) => Ok(Value::from(i64::from(b))),
            (Self::Float, Value::Number(n)) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.reject(&Value::Number(n))),
            (Self::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.reject(&Value::String(s))),
            (Self::String, v @ (Value::Bool(_) | Value::Number(_))) => {
                Ok(Value::String(v.to_string()))
            }
            (kind, other) => Err(kind.reject(&other)),
        }
    }

    fn reject(self, value: &Value) -> CoreError {
        CoreError::ValueConversion {
            kind: self,
            value: value.to_string(),
        }
    }
}

/// Integral numbers pass through; floats only when they carry no fraction.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn integer_from_number(n: &Number) -> Option<Number> {
    if n.is_i64() || n.is_u64() {
        return Some(n.clone());
    }
    let f = n.as_f64()?;
    if f.fract().abs() < f64::EPSILON && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Number::from(f as i64))
    } else {
        None
    }
}

// ── Timed value ──────────────────────────────────────────────────────

/// A resource value together with the instant it was observed.
///
/// `timestamp` is `None` until the resource has been written once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TimedValue {
    pub fn new(value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }

    /// Whether the resource has ever been written.
    pub fn is_set(&self) -> bool {
        self.timestamp.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infer_picks_narrowest_kind() {
        assert_eq!(ValueKind::infer(&json!(5)), ValueKind::Integer);
        assert_eq!(ValueKind::infer(&json!(5.5)), ValueKind::Float);
        assert_eq!(ValueKind::infer(&json!(true)), ValueKind::Boolean);
        assert_eq!(ValueKind::infer(&json!("on")), ValueKind::String);
        assert_eq!(ValueKind::infer(&json!([1, 2])), ValueKind::Any);
    }

    #[test]
    fn integer_accepts_whole_floats_and_numeric_strings() {
        assert_eq!(ValueKind::Integer.coerce(json!(4.0)).unwrap(), json!(4));
        assert_eq!(ValueKind::Integer.coerce(json!(" 17 ")).unwrap(), json!(17));
        assert_eq!(ValueKind::Integer.coerce(json!(true)).unwrap(), json!(1));
    }

    #[test]
    fn integer_rejects_fractions() {
        let err = ValueKind::Integer.coerce(json!(4.5)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValueConversion {
                kind: ValueKind::Integer,
                ..
            }
        ));
    }

    #[test]
    fn float_widens_integers() {
        assert_eq!(ValueKind::Float.coerce(json!(3)).unwrap(), json!(3.0));
        assert_eq!(ValueKind::Float.coerce(json!("2.5")).unwrap(), json!(2.5));
    }

    #[test]
    fn boolean_parses_common_spellings() {
        assert_eq!(ValueKind::Boolean.coerce(json!("ON")).unwrap(), json!(true));
        assert_eq!(ValueKind::Boolean.coerce(json!(0)).unwrap(), json!(false));
        assert!(ValueKind::Boolean.coerce(json!(7)).is_err());
    }

    #[test]
    fn string_renders_scalars_and_rejects_objects() {
        assert_eq!(ValueKind::String.coerce(json!(12)).unwrap(), json!("12"));
        assert!(ValueKind::String.coerce(json!({"a": 1})).is_err());
    }

    #[test]
    fn null_is_accepted_by_every_kind() {
        for kind in [
            ValueKind::Boolean,
            ValueKind::Integer,
            ValueKind::Float,
            ValueKind::String,
            ValueKind::Any,
        ] {
            assert_eq!(kind.coerce(Value::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Integer".parse::<ValueKind>().unwrap(), ValueKind::Integer);
        assert_eq!(ValueKind::Float.to_string(), "float");
    }
}
