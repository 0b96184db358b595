//! Driver-facing values and parameter encoding.
//!
//! [`IntoValue`] is the parameter encoding applied to everything bound into a
//! statement: chrono date/time types become [`Value::Timestamp`], `SqlEnum`
//! types become their symbolic name, [`Json`] becomes an opaque structured
//! value, and everything else passes through. [`TryIntoValue`] is what
//! statement builders accept: every `IntoValue` type, plus [`Json`], whose
//! encoding can fail.

use crate::error::{TabulaError, TabulaResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Storage type of a non-null [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int32,
    Int64,
    Float64,
    Text,
    Bytes,
    Timestamp,
    Json,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "Bool",
            ValueType::Int32 => "Int32",
            ValueType::Int64 => "Int64",
            ValueType::Float64 => "Float64",
            ValueType::Text => "Text",
            ValueType::Bytes => "Bytes",
            ValueType::Timestamp => "Timestamp",
            ValueType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// A single column or parameter value as exchanged with the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Int32(_) => Some(ValueType::Int32),
            Value::Int64(_) => Some(ValueType::Int64),
            Value::Float64(_) => Some(ValueType::Float64),
            Value::Text(_) => Some(ValueType::Text),
            Value::Bytes(_) => Some(ValueType::Bytes),
            Value::Timestamp(_) => Some(ValueType::Timestamp),
            Value::Json(_) => Some(ValueType::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable rendering used in logs and error contexts.
    pub fn render(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float64(v) => format!("{v}"),
            Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Value::Bytes(v) => format!("<{} bytes>", v.len()),
            Value::Timestamp(v) => format!("'{v}'"),
            Value::Json(v) => v.to_string(),
        }
    }

    fn type_name(&self) -> String {
        self.value_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "Null".to_string())
    }
}

/// Parameter encoding.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Column decoding.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> TabulaResult<Self>;
}

fn mismatch<T>(expected: &str, actual: &Value) -> TabulaResult<T> {
    Err(TabulaError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.type_name(),
    })
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        Ok(value.clone())
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => mismatch("Bool", other),
        }
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Int32(self)
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Int32(v) => Ok(*v),
            Value::Int64(v) => i32::try_from(*v).or_else(|_| mismatch("Int32", value)),
            other => mismatch("Int32", other),
        }
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Int64(self)
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Int64(v) => Ok(*v),
            Value::Int32(v) => Ok(i64::from(*v)),
            other => mismatch("Int64", other),
        }
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Float64(self)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Float64(v) => Ok(*v),
            other => mismatch("Float64", other),
        }
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            other => mismatch("Text", other),
        }
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::Bytes(self.to_vec())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Bytes(v) => Ok(v.clone()),
            other => mismatch("Bytes", other),
        }
    }
}

// Date/time values all travel as the driver's timestamp type.
impl IntoValue for NaiveDateTime {
    fn into_value(self) -> Value {
        Value::Timestamp(self)
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Timestamp(v) => Ok(*v),
            other => mismatch("Timestamp", other),
        }
    }
}

impl IntoValue for NaiveDate {
    fn into_value(self) -> Value {
        Value::Timestamp(self.and_time(NaiveTime::MIN))
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Timestamp(v) => Ok(v.date()),
            other => mismatch("Timestamp", other),
        }
    }
}

impl IntoValue for DateTime<Utc> {
    fn into_value(self) -> Value {
        Value::Timestamp(self.naive_utc())
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Timestamp(v) => Ok(v.and_utc()),
            other => mismatch("Timestamp", other),
        }
    }
}

impl IntoValue for serde_json::Value {
    fn into_value(self) -> Value {
        Value::Json(self)
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(v) => Ok(serde_json::from_str(v)?),
            other => mismatch("Json", other),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            Ok(Some(T::from_value(value)?))
        }
    }
}

/// Enum-like types stored under their symbolic name, usually derived with
/// `#[derive(SqlEnum)]`.
pub trait SqlEnum: Sized {
    fn sql_name(&self) -> &'static str;
    fn from_sql_name(name: &str) -> Option<Self>;

    /// Decodes a text column holding a symbolic name.
    fn decode_sql_name(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Text(name) => Self::from_sql_name(name).ok_or_else(|| TabulaError::TypeMismatch {
                expected: std::any::type_name::<Self>().to_string(),
                actual: format!("'{name}'"),
            }),
            other => mismatch("Text", other),
        }
    }
}

/// Fallible parameter encoding.
pub trait TryIntoValue {
    fn try_into_value(self) -> TabulaResult<Value>;
}

impl<T: IntoValue> TryIntoValue for T {
    fn try_into_value(self) -> TabulaResult<Value> {
        Ok(self.into_value())
    }
}

/// Marks a value to be stored as an opaque structured (JSON) column.
///
/// ```rust
/// use tabula_core::{Json, TryIntoValue, Value};
///
/// let v = Json(vec![1, 2, 3]).try_into_value().unwrap();
/// assert!(matches!(v, Value::Json(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Fails for values JSON cannot represent, such as maps with non-string keys.
impl<T: Serialize> TryIntoValue for Json<T> {
    fn try_into_value(self) -> TabulaResult<Value> {
        Ok(Value::Json(serde_json::to_value(&self.0)?))
    }
}

impl<T: DeserializeOwned> FromValue for Json<T> {
    fn from_value(value: &Value) -> TabulaResult<Self> {
        match value {
            Value::Json(v) => Ok(Json(serde_json::from_value(v.clone())?)),
            Value::Text(v) => Ok(Json(serde_json::from_str(v)?)),
            other => mismatch("Json", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(Value::Null.render(), "NULL");
        assert_eq!(Value::Int32(42).render(), "42");
        assert_eq!(Value::Text("O'Brien".into()).render(), "'O''Brien'");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).render(), "<3 bytes>");
    }

    #[test]
    fn test_date_time_coercion() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let midnight = date.and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(date.into_value(), Value::Timestamp(midnight));

        let zoned = midnight.and_utc();
        assert_eq!(zoned.into_value(), Value::Timestamp(midnight));
    }

    #[test]
    fn test_json_wrapper() {
        let v = Json(serde_json::json!({"tags": ["a", "b"]})).try_into_value().unwrap();
        assert_eq!(v.value_type(), Some(ValueType::Json));

        let back: Json<std::collections::BTreeMap<String, Vec<String>>> =
            FromValue::from_value(&v).unwrap();
        assert_eq!(back.0["tags"], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_json_with_non_string_keys_is_rejected() {
        let mut keyed = std::collections::HashMap::new();
        keyed.insert((1, 2), 3);
        let err = Json(keyed).try_into_value().unwrap_err();
        assert!(matches!(err, TabulaError::Serialization(_)));
    }

    #[test]
    fn test_integer_widening_and_narrowing() {
        assert_eq!(i64::from_value(&Value::Int32(7)).unwrap(), 7);
        assert_eq!(i32::from_value(&Value::Int64(7)).unwrap(), 7);
        assert!(i32::from_value(&Value::Int64(i64::MAX)).is_err());
    }

    #[test]
    fn test_option_round_trip() {
        assert_eq!(Option::<i32>::None.into_value(), Value::Null);
        assert_eq!(Some(10i32).into_value(), Value::Int32(10));
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
    }

    #[test]
    fn test_mismatch_reports_types() {
        let err = bool::from_value(&Value::Text("yes".into())).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch: expected Bool, got Text");
    }
}
