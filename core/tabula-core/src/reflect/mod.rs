//! Structural records.
//!
//! An immutable record type describes itself as a [`Shape`]: a tree whose
//! leaves are typed columns and whose inner nodes are nested records. A
//! [`Reflector`] aligns an ordered list of column names (with holes) against a
//! base shape, and compiles [`RecordMapper`]s for any target shape that lines
//! up with the bound names.
//!
//! `#[derive(Record)]` implements [`Component`] and [`Record`] for structs;
//! scalars, `Option` of scalars and tuples are covered here.

mod reflector;

pub use reflector::{RecordMapper, Reflector};

use crate::error::{TabulaError, TabulaResult};
use crate::value::{FromValue, Json, SqlEnum, Value, ValueType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;

/// Type of one flattened column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafType {
    pub value_type: ValueType,
    pub nullable: bool,
}

impl LeafType {
    pub const fn required(value_type: ValueType) -> Self {
        Self {
            value_type,
            nullable: false,
        }
    }

    pub const fn nullable(value_type: ValueType) -> Self {
        Self {
            value_type,
            nullable: true,
        }
    }

    /// Whether `value` may occupy a position of this type.
    pub fn admits(&self, value: &Value) -> bool {
        match value.value_type() {
            None => self.nullable,
            Some(actual) => actual == self.value_type,
        }
    }
}

impl fmt::Display for LeafType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?", self.value_type)
        } else {
            write!(f, "{}", self.value_type)
        }
    }
}

/// Type-shape tree of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Leaf(LeafType),
    Record {
        name: &'static str,
        components: Vec<Shape>,
    },
}

impl Shape {
    pub fn record(name: &'static str, components: Vec<Shape>) -> Self {
        Shape::Record { name, components }
    }

    pub fn name(&self) -> String {
        match self {
            Shape::Leaf(leaf) => leaf.to_string(),
            Shape::Record { name, .. } => (*name).to_string(),
        }
    }

    /// Leaves in depth-first, left-to-right order.
    pub fn leaves(&self) -> Vec<LeafType> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Shape::Leaf(_) => 1,
            Shape::Record { components, .. } => components.iter().map(Shape::leaf_count).sum(),
        }
    }

    fn collect_leaves(&self, out: &mut Vec<LeafType>) {
        match self {
            Shape::Leaf(leaf) => out.push(*leaf),
            Shape::Record { components, .. } => {
                for component in components {
                    component.collect_leaves(out);
                }
            }
        }
    }
}

/// Anything that can occupy a position in a record: a scalar column or a
/// nested record.
pub trait Component: Sized {
    fn shape() -> Shape;

    /// Pulls this component's values, left to right, from `reader`.
    fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self>;
}

/// Marker for immutable structured records, usually derived.
pub trait Record: Component {}

/// Left-to-right cursor over one row's values.
#[derive(Debug)]
pub struct ValueReader<'a> {
    values: &'a [Value],
    pos: usize,
}

impl<'a> ValueReader<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        Self { values, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.values.len() - self.pos
    }

    pub fn next_value(&mut self) -> TabulaResult<&'a Value> {
        let value = self.values.get(self.pos).ok_or_else(|| {
            TabulaError::decode(
                format!("row exhausted after {} values", self.values.len()),
                &[],
            )
        })?;
        self.pos += 1;
        Ok(value)
    }

    pub fn read<T: FromValue>(&mut self) -> TabulaResult<T> {
        let pos = self.pos;
        let value = self.next_value()?;
        T::from_value(value).map_err(|e| TabulaError::Column {
            column: format!("#{pos}"),
            reason: e.to_string(),
        })
    }
}

macro_rules! scalar_component {
    ($($ty:ty => $vt:ident),* $(,)?) => {
        $(
            impl Component for $ty {
                fn shape() -> Shape {
                    Shape::Leaf(LeafType::required(ValueType::$vt))
                }

                fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
                    reader.read()
                }
            }

            impl Component for Option<$ty> {
                fn shape() -> Shape {
                    Shape::Leaf(LeafType::nullable(ValueType::$vt))
                }

                fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
                    reader.read()
                }
            }
        )*
    };
}

scalar_component! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f64 => Float64,
    String => Text,
    Vec<u8> => Bytes,
    NaiveDateTime => Timestamp,
    NaiveDate => Timestamp,
    DateTime<Utc> => Timestamp,
    serde_json::Value => Json,
}

impl<T: DeserializeOwned> Component for Json<T> {
    fn shape() -> Shape {
        Shape::Leaf(LeafType::required(ValueType::Json))
    }

    fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
        reader.read()
    }
}

impl<T: DeserializeOwned> Component for Option<Json<T>> {
    fn shape() -> Shape {
        Shape::Leaf(LeafType::nullable(ValueType::Json))
    }

    fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
        reader.read()
    }
}

// Derived enums implement `Component` themselves; their optional form lives
// here because `Option<E>` is foreign to the deriving crate.
impl<T: SqlEnum + FromValue> Component for Option<T> {
    fn shape() -> Shape {
        Shape::Leaf(LeafType::nullable(ValueType::Text))
    }

    fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
        reader.read()
    }
}

macro_rules! tuple_record {
    ($($name:ident),+) => {
        impl<$($name: Component),+> Component for ($($name,)+) {
            fn shape() -> Shape {
                Shape::record("tuple", vec![$($name::shape()),+])
            }

            fn read(reader: &mut ValueReader<'_>) -> TabulaResult<Self> {
                Ok(($($name::read(reader)?,)+))
            }
        }

        impl<$($name: Component),+> Record for ($($name,)+) {}
    };
}

tuple_record!(A);
tuple_record!(A, B);
tuple_record!(A, B, C);
tuple_record!(A, B, C, D);
tuple_record!(A, B, C, D, E);
tuple_record!(A, B, C, D, E, F);
tuple_record!(A, B, C, D, E, F, G);
tuple_record!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_tuple_leaves_flatten_depth_first() {
        let shape = <(i32, (f64, f64, f64), Option<String>)>::shape();
        assert_eq!(shape.leaf_count(), 5);
        assert_eq!(
            shape.leaves(),
            vec![
                LeafType::required(ValueType::Int32),
                LeafType::required(ValueType::Float64),
                LeafType::required(ValueType::Float64),
                LeafType::required(ValueType::Float64),
                LeafType::nullable(ValueType::Text),
            ]
        );
    }

    #[test]
    fn reader_builds_nested_values_left_to_right() {
        let values = vec![
            Value::Int32(1),
            Value::Float64(0.5),
            Value::Float64(1.5),
            Value::Float64(2.5),
            Value::Null,
        ];
        let mut reader = ValueReader::new(&values);
        let got = <(i32, (f64, f64, f64), Option<String>)>::read(&mut reader).unwrap();
        assert_eq!(got, (1, (0.5, 1.5, 2.5), None));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn leaf_admits_null_only_when_nullable() {
        assert!(LeafType::nullable(ValueType::Int64).admits(&Value::Null));
        assert!(!LeafType::required(ValueType::Int64).admits(&Value::Null));
        assert!(!LeafType::required(ValueType::Int64).admits(&Value::Int32(1)));
    }

    #[test]
    fn leaf_display() {
        assert_eq!(LeafType::nullable(ValueType::Text).to_string(), "Text?");
        assert_eq!(LeafType::required(ValueType::Int32).to_string(), "Int32");
    }
}
