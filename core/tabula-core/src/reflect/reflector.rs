//! Column-name templates aligned against record shapes.

use super::{LeafType, Record, Shape, ValueReader};
use crate::error::{TabulaError, TabulaResult};
use crate::row::Row;
use crate::value::Value;
use ahash::AHashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Ordered column names bound to the flattened leaves of a base shape.
///
/// Every leaf of the base has a name. A leaf can be switched off (a *hole*)
/// with [`excluding`](Self::excluding) or [`only`](Self::only); holes are
/// not selected and never consume a target position when a mapper is
/// compiled. Reflectors are immutable, derived ones share the base.
#[derive(Debug, Clone)]
pub struct Reflector {
    base: Arc<Shape>,
    leaves: Arc<[LeafType]>,
    template: Arc<[String]>,
    active: Arc<[bool]>,
}

impl Reflector {
    /// Binds `names` to the leaves of `B`.
    pub fn of<B: Record>(names: &[&str]) -> TabulaResult<Self> {
        Self::new(B::shape(), names)
    }

    /// Binds `names` to the leaves of `base`. Empty names are ignored; the
    /// remaining count must equal the base's leaf count.
    pub fn new(base: Shape, names: &[&str]) -> TabulaResult<Self> {
        let leaves = base.leaves();
        let names: Vec<String> = names
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .collect();

        if names.len() < leaves.len() {
            let idx = names.len();
            return Err(TabulaError::Mapping(format!(
                "{}: component {idx} ({}) has no column name ({} names for {} components)",
                base.name(),
                leaves[idx],
                names.len(),
                leaves.len()
            )));
        }
        if names.len() > leaves.len() {
            let idx = leaves.len();
            return Err(TabulaError::Mapping(format!(
                "{}: column '{}' at position {idx} has no component ({} names for {} components)",
                base.name(),
                names[idx],
                names.len(),
                leaves.len()
            )));
        }

        let mut seen = AHashSet::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(TabulaError::Mapping(format!(
                    "{}: column '{name}' bound twice (again at position {idx})",
                    base.name()
                )));
            }
        }

        let active = vec![true; names.len()];
        Ok(Self {
            base: Arc::new(base),
            leaves: leaves.into(),
            template: names.into(),
            active: active.into(),
        })
    }

    pub fn base(&self) -> &Shape {
        &self.base
    }

    /// All positions, `""` for holes.
    pub fn names(&self) -> Vec<&str> {
        self.template
            .iter()
            .zip(self.active.iter())
            .map(|(name, on)| if *on { name.as_str() } else { "" })
            .collect()
    }

    /// Bound (non-hole) column names in order.
    pub fn columns(&self) -> Vec<&str> {
        self.template
            .iter()
            .zip(self.active.iter())
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Comma-separated bound columns, ready for a `SELECT` list.
    pub fn select_list(&self) -> String {
        self.columns().join(", ")
    }

    /// A reflector with `names` turned into holes.
    pub fn excluding(&self, names: &[&str]) -> TabulaResult<Self> {
        let positions = self.positions_of(names)?;
        let active: Vec<bool> = self
            .active
            .iter()
            .enumerate()
            .map(|(idx, on)| *on && !positions.contains(&idx))
            .collect();
        Ok(self.with_active(active))
    }

    /// A reflector binding exactly `names`; every other position is a hole.
    pub fn only(&self, names: &[&str]) -> TabulaResult<Self> {
        let positions = self.positions_of(names)?;
        let active: Vec<bool> = (0..self.template.len())
            .map(|idx| positions.contains(&idx))
            .collect();
        Ok(self.with_active(active))
    }

    /// Compiles a mapper for `T`.
    ///
    /// Bound base leaves and the leaves of `T` are walked in lock-step; holes
    /// are skipped without consuming a target position. Each pair must be
    /// the same type, nullability included.
    pub fn mapper<T: Record>(&self) -> TabulaResult<RecordMapper<T>> {
        let target = T::shape();
        let wanted = target.leaves();
        let mut steps = Vec::with_capacity(wanted.len());

        for (base_idx, leaf) in self.leaves.iter().enumerate() {
            if !self.active[base_idx] {
                continue;
            }
            let column = &self.template[base_idx];
            let target_idx = steps.len();
            let Some(want) = wanted.get(target_idx) else {
                return Err(TabulaError::Mapping(format!(
                    "{} has {} components but column '{column}' (base position {base_idx}) is still bound",
                    target.name(),
                    wanted.len()
                )));
            };
            if want != leaf {
                return Err(TabulaError::Mapping(format!(
                    "column '{column}': base position {base_idx} is {leaf} but {} position {target_idx} is {want}",
                    target.name()
                )));
            }
            steps.push(Step {
                column: column.clone(),
                leaf: *leaf,
            });
        }

        if steps.len() < wanted.len() {
            let target_idx = steps.len();
            return Err(TabulaError::Mapping(format!(
                "{} position {target_idx} ({}) has no bound column; {} bound for {} components",
                target.name(),
                wanted[target_idx],
                steps.len(),
                wanted.len()
            )));
        }

        Ok(RecordMapper {
            target: target.name(),
            steps: steps.into(),
            _marker: PhantomData,
        })
    }

    fn positions_of(&self, names: &[&str]) -> TabulaResult<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.template
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        TabulaError::Mapping(format!(
                            "{}: no column named '{name}' (have {})",
                            self.base.name(),
                            self.template.join(", ")
                        ))
                    })
            })
            .collect()
    }

    fn with_active(&self, active: Vec<bool>) -> Self {
        Self {
            base: Arc::clone(&self.base),
            leaves: Arc::clone(&self.leaves),
            template: Arc::clone(&self.template),
            active: active.into(),
        }
    }
}

impl fmt::Display for Reflector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.base.name(), self.names().join(", "))
    }
}

#[derive(Debug, Clone)]
struct Step {
    column: String,
    leaf: LeafType,
}

/// Compiled row → `T` function. The shape walk happened once, in
/// [`Reflector::mapper`]; mapping a row is a flat pass over its values.
pub struct RecordMapper<T> {
    target: String,
    steps: Arc<[Step]>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RecordMapper<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            steps: Arc::clone(&self.steps),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RecordMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordMapper")
            .field("target", &self.target)
            .field("columns", &self.columns())
            .finish()
    }
}

impl<T> RecordMapper<T> {
    /// Number of values consumed per row.
    pub fn width(&self) -> usize {
        self.steps.len()
    }

    pub fn columns(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.column.as_str()).collect()
    }
}

impl<T: Record> RecordMapper<T> {
    /// Maps a row by looking up every bound column by name. Columns the
    /// mapper does not use may appear anywhere in the row.
    pub fn map(&self, row: &Row) -> TabulaResult<T> {
        let values = self
            .steps
            .iter()
            .map(|step| row.value(&step.column).cloned())
            .collect::<TabulaResult<Vec<Value>>>()
            .map_err(|e| self.failure(format!("reading {}: {e}", self.target), row.values()))?;
        self.map_values(&values)
    }

    /// Maps values given positionally, one per bound column.

    pub fn map_values(&self, values: &[Value]) -> TabulaResult<T> {
        if values.len() != self.steps.len() {
            return Err(self.failure(
                format!(
                    "row has {} values, {} expects {}",
                    values.len(),
                    self.target,
                    self.steps.len()
                ),
                values,
            ));
        }
        for (step, value) in self.steps.iter().zip(values) {
            if value.is_null() && !step.leaf.nullable {
                return Err(self.failure(
                    format!("column '{}' is NULL but {} requires {}", step.column, self.target, step.leaf),
                    values,
                ));
            }
        }

        let mut reader = ValueReader::new(values);
        let record = T::read(&mut reader)
            .map_err(|e| self.failure(format!("constructing {}: {e}", self.target), values))?;
        if reader.remaining() != 0 {
            return Err(self.failure(
                format!("{} left {} values unread", self.target, reader.remaining()),
                values,
            ));
        }
        Ok(record)
    }

    fn failure(&self, message: String, values: &[Value]) -> TabulaError {
        let rendered: Vec<String> = values.iter().map(Value::render).collect();
        TabulaError::decode(format!("{message}; row: ({})", rendered.join(", ")), &[])
    }
}
