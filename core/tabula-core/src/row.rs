//! Rows and column-name resolution.
//!
//! A [`Row`] is an immutable positional value array paired with a shared
//! [`ColumnResolver`]. Names resolve two ways:
//!
//! - qualified `table/column`: always resolves when the column exists
//! - bare `column`: resolves only if exactly one contributing table has it
//!
//! Ambiguity is computed once when the resolver is built; looking up an
//! ambiguous bare name is an error, holding one is not.

use crate::driver::ColumnMeta;
use crate::error::{TabulaError, TabulaResult};
use crate::value::{FromValue, Value};
use ahash::AHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Slot {
    Unique(usize),
    Ambiguous(Vec<String>),
}

/// Name → index resolver shared by every row of one result.
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    columns: Vec<ColumnMeta>,
    bare: AHashMap<String, Slot>,
    qualified: AHashMap<String, usize>,
}

impl ColumnResolver {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        let mut bare: AHashMap<String, Slot> = AHashMap::with_capacity(columns.len());
        let mut qualified = AHashMap::with_capacity(columns.len());

        for (idx, column) in columns.iter().enumerate() {
            let name = column.name.to_ascii_lowercase();
            let table = column.table.as_deref().unwrap_or("").to_ascii_lowercase();

            if !table.is_empty() {
                // first occurrence wins for repeated table/column pairs
                qualified.entry(format!("{table}/{name}")).or_insert(idx);
            }

            match bare.entry(name) {
                Entry::Vacant(entry) => {
                    entry.insert(Slot::Unique(idx));
                }
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    let mut sources = match slot {
                        Slot::Unique(prev) => vec![source_of(&columns[*prev])],
                        Slot::Ambiguous(sources) => std::mem::take(sources),
                    };
                    sources.push(source_of(column));
                    *slot = Slot::Ambiguous(sources);
                }
            }
        }

        Self {
            columns,
            bare,
            qualified,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Bare names that cannot be looked up without a table qualifier.
    pub fn ambiguous_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .bare
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ambiguous(_)))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Resolves `column` or `table/column` to a position.
    pub fn resolve(&self, name: &str) -> TabulaResult<usize> {
        match self.lookup(name) {
            Lookup::Found(idx) => Ok(idx),
            Lookup::Missing => Err(TabulaError::Column {
                column: name.to_string(),
                reason: "no such column in result".to_string(),
            }),
            Lookup::Ambiguous(sources) => Err(TabulaError::Column {
                column: name.to_string(),
                reason: format!(
                    "ambiguous, present in {}; qualify it as table/column",
                    sources.join(", ")
                ),
            }),
        }
    }

    /// Like [`resolve`](Self::resolve) but treats missing or ambiguous names
    /// as absent.
    pub fn find(&self, name: &str) -> Option<usize> {
        match self.lookup(name) {
            Lookup::Found(idx) => Some(idx),
            _ => None,
        }
    }

    fn lookup(&self, name: &str) -> Lookup<'_> {
        let key = name.to_ascii_lowercase();
        if key.contains('/') {
            return match self.qualified.get(&key) {
                Some(idx) => Lookup::Found(*idx),
                None => Lookup::Missing,
            };
        }
        match self.bare.get(&key) {
            Some(Slot::Unique(idx)) => Lookup::Found(*idx),
            Some(Slot::Ambiguous(sources)) => Lookup::Ambiguous(sources),
            None => Lookup::Missing,
        }
    }
}

enum Lookup<'a> {
    Found(usize),
    Missing,
    Ambiguous(&'a [String]),
}

fn source_of(column: &ColumnMeta) -> String {
    column.table.clone().unwrap_or_else(|| "<expression>".to_string())
}

/// One result row.
#[derive(Debug, Clone)]
pub struct Row {
    values: Arc<[Value]>,
    resolver: Arc<ColumnResolver>,
}

impl Row {
    pub fn new(values: Vec<Value>, resolver: Arc<ColumnResolver>) -> TabulaResult<Self> {
        if values.len() != resolver.len() {
            return Err(TabulaError::decode(
                format!(
                    "row has {} values but result declares {} columns",
                    values.len(),
                    resolver.len()
                ),
                &[],
            ));
        }
        Ok(Self {
            values: values.into(),
            resolver,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn resolver(&self) -> &Arc<ColumnResolver> {
        &self.resolver
    }

    pub fn at(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn value(&self, name: &str) -> TabulaResult<&Value> {
        let idx = self.resolver.resolve(name)?;
        Ok(&self.values[idx])
    }

    /// Value of `name`, or `None` if the row has no unambiguous column by
    /// that name.
    pub fn try_value(&self, name: &str) -> Option<&Value> {
        self.resolver.find(name).map(|idx| &self.values[idx])
    }

    pub fn get<T: FromValue>(&self, name: &str) -> TabulaResult<T> {
        let value = self.value(name)?;
        T::from_value(value).map_err(|e| TabulaError::Column {
            column: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn get_at<T: FromValue>(&self, idx: usize) -> TabulaResult<T> {
        let value = self.at(idx).ok_or_else(|| TabulaError::Column {
            column: format!("#{idx}"),
            reason: format!("row has only {} columns", self.values.len()),
        })?;
        T::from_value(value)
    }
}
