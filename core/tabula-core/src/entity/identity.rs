//! Hashable entity identities.

use crate::value::Value;
use chrono::NaiveDateTime;
use smallvec::SmallVec;
use std::fmt;

/// One component of an identity. Integer widths are unified so an `Int32`
/// key column and an `Int64` foreign key address the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Json(String),
}

impl KeyPart {
    /// `None` for NULL: a NULL never identifies anything.
    pub fn from_value(value: &Value) -> Option<Self> {
        let part = match value {
            Value::Null => return None,
            Value::Bool(v) => KeyPart::Bool(*v),
            Value::Int32(v) => KeyPart::Int(i64::from(*v)),
            Value::Int64(v) => KeyPart::Int(*v),
            Value::Float64(v) => KeyPart::Float(v.to_bits()),
            Value::Text(v) => KeyPart::Text(v.clone()),
            Value::Bytes(v) => KeyPart::Bytes(v.clone()),
            Value::Timestamp(v) => KeyPart::Timestamp(*v),
            Value::Json(v) => KeyPart::Json(v.to_string()),
        };
        Some(part)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(v) => write!(f, "{v}"),
            KeyPart::Int(v) => write!(f, "{v}"),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Text(v) => write!(f, "'{v}'"),
            KeyPart::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            KeyPart::Timestamp(v) => write!(f, "'{v}'"),
            KeyPart::Json(v) => f.write_str(v),
        }
    }
}

/// Possibly composite identity of one entity row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(SmallVec<[KeyPart; 2]>);

impl IdentityKey {
    /// `None` if any component is NULL (the entity is transient).
    pub fn from_values(values: &[Value]) -> Option<Self> {
        values
            .iter()
            .map(KeyPart::from_value)
            .collect::<Option<SmallVec<_>>>()
            .map(IdentityKey)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Values accepted where an identity is looked up: a single value or a tuple
/// for composite keys.
pub trait IntoIdentity {
    fn into_identity(self) -> Vec<Value>;
}

macro_rules! single_identity {
    ($($ty:ty),*) => {
        $(
            impl IntoIdentity for $ty {
                fn into_identity(self) -> Vec<Value> {
                    vec![crate::value::IntoValue::into_value(self)]
                }
            }
        )*
    };
}

single_identity!(Value, bool, i32, i64, String, &str, Vec<u8>, NaiveDateTime);

impl IntoIdentity for Vec<Value> {
    fn into_identity(self) -> Vec<Value> {
        self
    }
}

macro_rules! composite_identity {
    ($($name:ident),+) => {
        impl<$($name: crate::value::IntoValue),+> IntoIdentity for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_identity(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$(crate::value::IntoValue::into_value($name)),+]
            }
        }
    };
}

composite_identity!(A, B);
composite_identity!(A, B, C);
composite_identity!(A, B, C, D);
