//! Statement builders and named parameters
//!
//! Two binding styles, never mixed in one statement:
//! - Positional: `?` placeholders, `.bind(value)`
//! - Named: `:name` tokens, `.param("name", value)`, rewritten left to right
//!   into `?` before the statement reaches the driver. A name may appear
//!   more than once; `::` casts and quoted text are left alone.

use crate::entity::{Entity, EntityBinding};
use crate::error::{TabulaError, TabulaResult};
use crate::reflect::{Record, RecordMapper};
use crate::row::{ColumnResolver, Row};
use crate::transaction::Transaction;
use crate::value::{FromValue, TryIntoValue, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use thiserror::Error;

/// Parameter binding failure, detected before any driver call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("parameter :{0} is not bound")]
    Unbound(String),

    #[error("parameter :{0} is not used by the statement")]
    Unused(String),

    #[error("positional and named parameters cannot be mixed")]
    Mixed,

    #[error("parameter {name} cannot be encoded: {reason}")]
    Encode { name: String, reason: String },
}

/// Bound parameters of one statement.
#[derive(Debug, Clone, Default)]
pub struct Params {
    positional: Vec<Value>,
    named: IndexMap<String, Value>,
    failure: Option<ParamError>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<V: TryIntoValue>(&mut self, value: V) {
        let name = format!("?{}", self.positional.len() + 1);
        let value = self.encode(name, value);
        self.positional.push(value);
    }

    /// Binds `name`; binding the same name again replaces the value.
    pub fn param<V: TryIntoValue>(&mut self, name: &str, value: V) {
        let name = name.trim_start_matches(':').to_string();
        let value = self.encode(format!(":{name}"), value);
        self.named.insert(name, value);
    }

    /// The first encoding failure is kept and reported by `resolve`.
    fn encode<V: TryIntoValue>(&mut self, name: String, value: V) -> Value {
        match value.try_into_value() {
            Ok(value) => value,
            Err(e) => {
                if self.failure.is_none() {
                    self.failure = Some(ParamError::Encode {
                        name,
                        reason: e.to_string(),
                    });
                }
                Value::Null
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Final positional SQL and parameter list for `sql`.
    pub fn resolve(&self, sql: &str) -> Result<(String, Vec<Value>), ParamError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if !self.positional.is_empty() && !self.named.is_empty() {
            return Err(ParamError::Mixed);
        }
        let (rewritten, names) = rewrite_named(sql);
        if let Some(unused) = self.named.keys().find(|bound| !names.contains(bound)) {
            return Err(ParamError::Unused(unused.clone()));
        }
        if names.is_empty() {
            return Ok((sql.to_string(), self.positional.clone()));
        }
        if !self.positional.is_empty() {
            return Err(ParamError::Mixed);
        }

        let params = names
            .into_iter()
            .map(|name| match self.named.get(&name) {
                Some(value) => Ok(value.clone()),
                None => Err(ParamError::Unbound(name)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rewritten, params))
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replaces `:name` tokens with `?`, returning the names in order.
fn rewrite_named(sql: &str) -> (String, Vec<String>) {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut names = Vec::new();
    let mut last = 0;
    let mut i = 0;

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b':' if i + 1 < len && bytes[i + 1] == b':' => i += 2,
            b':' if i + 1 < len && is_ident_start(bytes[i + 1]) => {
                let start = i + 1;
                let mut end = start;
                while end < len && is_ident_char(bytes[end]) {
                    end += 1;
                }
                out.push_str(&sql[last..i]);
                out.push('?');
                names.push(sql[start..end].to_string());
                last = end;
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[last..]);
    (out, names)
}

/// Query builder returning rows
pub struct Query<'t> {
    tx: &'t Transaction<'t>,
    sql: String,
    params: Params,
}

impl<'t> Query<'t> {
    pub fn new(tx: &'t Transaction<'t>, sql: impl Into<String>) -> Self {
        Self {
            tx,
            sql: sql.into(),
            params: Params::new(),
        }
    }

    /// Positional parameter binding (`?`)
    pub fn bind<V: TryIntoValue>(mut self, value: V) -> Self {
        self.params.bind(value);
        self
    }

    pub fn bind_all(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        for value in values {
            self.params.bind(value);
        }
        self
    }

    /// Named parameter binding (`:name`)
    pub fn param<V: TryIntoValue>(mut self, name: &str, value: V) -> Self {
        self.params.param(name, value);
        self
    }

    pub(crate) fn prefixed(mut self, prefix: &str) -> Self {
        self.sql = if self.sql.trim().is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix} {}", self.sql.trim())
        };
        self
    }

    /// Every row of the result.
    pub fn fetch_rows(self) -> TabulaResult<Vec<Row>> {
        self.map_rows(Ok)
    }

    /// Exactly one row (zero or several rows is an error).
    pub fn fetch_one(self) -> TabulaResult<Row> {
        let tx = self.tx;
        let sql = self.sql.clone();
        let mut rows = self.fetch_rows()?;
        if rows.len() != 1 {
            return Err(TabulaError::database(
                format!("expected 1 row, got {}", rows.len()),
                tx.context(&sql, &[]),
            ));
        }
        Ok(rows.swap_remove(0))
    }

    /// First row, if any (the rest are ignored).
    pub fn fetch_optional(self) -> TabulaResult<Option<Row>> {
        Ok(self.fetch_rows()?.into_iter().next())
    }

    /// First column of the only row.
    pub fn fetch_scalar<T: FromValue>(self) -> TabulaResult<T> {
        let tx = self.tx;
        let sql = self.sql.clone();
        self.fetch_one()?
            .get_at(0)
            .map_err(|e| e.with_context(tx.context(&sql, &[])))
    }

    /// Maps each row with a compiled record mapper.
    pub fn fetch_records<T: Record>(self, mapper: &RecordMapper<T>) -> TabulaResult<Vec<T>> {
        self.fetch_map(|row| mapper.map(row))
    }

    /// Injects each row into a fresh entity and runs its post-load hook.
    pub fn fetch_entities<E: Entity>(self) -> TabulaResult<Vec<E>> {
        let binding = EntityBinding::<E>::of()?;
        let tx = self.tx;
        self.fetch_map(|row| binding.load(row, tx))
    }

    pub fn fetch_map<T, F>(self, mut f: F) -> TabulaResult<Vec<T>>
    where
        F: FnMut(&Row) -> TabulaResult<T>,
    {
        self.map_rows(|row| f(&row))
    }

    /// Row-level failures are tagged with the statement that produced them.
    fn map_rows<T>(self, mut f: impl FnMut(Row) -> TabulaResult<T>) -> TabulaResult<Vec<T>> {
        let (sql, params) = resolve(self.tx, &self.sql, &self.params)?;
        let result = self.tx.run_query(&sql, &params)?;
        let resolver = Arc::new(ColumnResolver::new(result.columns));
        result
            .rows
            .into_iter()
            .map(|values| Row::new(values, Arc::clone(&resolver)).and_then(&mut f))
            .collect::<TabulaResult<Vec<T>>>()
            .map_err(|e| e.with_context(self.tx.context(&sql, &params)))
    }
}

/// Execute builder for INSERT/UPDATE/DELETE
pub struct Execute<'t> {
    tx: &'t Transaction<'t>,
    sql: String,
    params: Params,
}

impl<'t> Execute<'t> {
    pub fn new(tx: &'t Transaction<'t>, sql: impl Into<String>) -> Self {
        Self {
            tx,
            sql: sql.into(),
            params: Params::new(),
        }
    }

    pub fn bind<V: TryIntoValue>(mut self, value: V) -> Self {
        self.params.bind(value);
        self
    }

    pub fn bind_all(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        for value in values {
            self.params.bind(value);
        }
        self
    }

    pub fn param<V: TryIntoValue>(mut self, name: &str, value: V) -> Self {
        self.params.param(name, value);
        self
    }

    /// Runs the statement → number of affected rows
    pub fn run(self) -> TabulaResult<u64> {
        let (sql, params) = resolve(self.tx, &self.sql, &self.params)?;
        self.tx.run_execute(&sql, &params)
    }
}

fn resolve(tx: &Transaction<'_>, sql: &str, params: &Params) -> TabulaResult<(String, Vec<Value>)> {
    params
        .resolve(sql)
        .map_err(|e| TabulaError::database(e.to_string(), tx.context(sql, &[])))
}
