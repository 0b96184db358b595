//! Driver seam.
//!
//! tabula never talks to a database directly. A driver implements
//! [`Connection`] on top of its native session and hands connections out
//! through a [`ConnectionProvider`]. Everything here is synchronous: each call
//! blocks until the driver finishes or fails.

use crate::value::Value;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Failure reported by a driver, optionally carrying a SQLSTATE code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub sqlstate: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// SQLSTATE class 23: integrity constraint violation.
    pub fn is_integrity_violation(&self) -> bool {
        self.sqlstate
            .as_deref()
            .is_some_and(|state| state.starts_with("23"))
    }
}

/// Column metadata as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Source table, when the driver knows it
    pub table: Option<String>,
    pub name: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
        }
    }
}

/// A fully materialized query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }
}

/// Handle of a statement prepared on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(pub u64);

/// Handle of an open server-side cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub u64);

/// Chunked output of a `COPY … TO STDOUT`. Each chunk is one length-prefixed
/// message from the server.
pub trait CopyOutSource {
    fn next_chunk(&mut self) -> DriverResult<Option<Vec<u8>>>;
}

/// A live session with the SQL engine.
///
/// Statements use `?` positional placeholders. Savepoint names are plain SQL
/// identifiers chosen by the caller.
pub trait Connection: Send {
    fn begin(&mut self, read_only: bool) -> DriverResult<()>;
    fn commit(&mut self) -> DriverResult<()>;
    fn rollback(&mut self) -> DriverResult<()>;

    fn savepoint(&mut self, name: &str) -> DriverResult<()>;
    fn release_savepoint(&mut self, name: &str) -> DriverResult<()>;
    fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()>;

    /// Runs a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64>;

    /// Runs an INSERT and returns the generated values of `key_columns`.
    fn insert_returning(
        &mut self,
        sql: &str,
        params: &[Value],
        key_columns: &[&str],
    ) -> DriverResult<Vec<Value>>;

    fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<ResultSet>;

    fn prepare(&mut self, sql: &str) -> DriverResult<StatementId>;
    fn open_cursor(
        &mut self,
        statement: StatementId,
        params: &[Value],
        fetch_size: usize,
    ) -> DriverResult<(CursorId, Vec<ColumnMeta>)>;
    fn fetch(&mut self, cursor: CursorId) -> DriverResult<Option<Vec<Value>>>;
    fn close_cursor(&mut self, cursor: CursorId) -> DriverResult<()>;
    fn close_statement(&mut self, statement: StatementId) -> DriverResult<()>;

    fn copy_out<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn CopyOutSource + 'c>>;

    /// Returns the session to whoever provided it.
    fn close(&mut self) -> DriverResult<()>;
}

/// Source of fresh connections. Pooling, authentication and timeouts live
/// behind this trait.
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self) -> DriverResult<Box<dyn Connection>>;
}
