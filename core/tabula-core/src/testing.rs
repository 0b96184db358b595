//! Scripted in-memory driver.
//!
//! [`MockProvider`] hands out connections that record every call and answer
//! from queues filled by the test: result sets, generated keys, affected
//! counts and COPY chunks. Any call kind can be made to fail once, optionally
//! after a number of successful calls.
//!
//! ```rust,ignore
//! let provider = MockProvider::new();
//! provider.push_result(ResultSet::new(vec![ColumnMeta::new("n")]).with_row(vec![Value::Int64(1)]));
//! let db = Database::new(provider.clone());
//! // ...
//! assert_eq!(provider.log(), vec!["BEGIN", "SELECT count(*) AS n FROM t", "COMMIT"]);
//! ```

use crate::driver::{
    ColumnMeta, Connection, ConnectionProvider, CopyOutSource, CursorId, DriverError, DriverResult,
    ResultSet, StatementId,
};
use crate::value::Value;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Begin { read_only: bool },
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    Execute { sql: String, params: Vec<Value> },
    InsertReturning { sql: String, params: Vec<Value>, keys: Vec<String> },
    Query { sql: String, params: Vec<Value> },
    Prepare(String),
    OpenCursor { statement: u64, params: Vec<Value>, fetch_size: usize },
    Fetch(u64),
    CloseCursor(u64),
    CloseStatement(u64),
    CopyOut(String),
    Close,
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::Connect => CallKind::Connect,
            Call::Begin { .. } => CallKind::Begin,
            Call::Commit => CallKind::Commit,
            Call::Rollback => CallKind::Rollback,
            Call::Savepoint(_) => CallKind::Savepoint,
            Call::ReleaseSavepoint(_) => CallKind::ReleaseSavepoint,
            Call::RollbackToSavepoint(_) => CallKind::RollbackToSavepoint,
            Call::Execute { .. } => CallKind::Execute,
            Call::InsertReturning { .. } => CallKind::InsertReturning,
            Call::Query { .. } => CallKind::Query,
            Call::Prepare(_) => CallKind::Prepare,
            Call::OpenCursor { .. } => CallKind::OpenCursor,
            Call::Fetch(_) => CallKind::Fetch,
            Call::CloseCursor(_) => CallKind::CloseCursor,
            Call::CloseStatement(_) => CallKind::CloseStatement,
            Call::CopyOut(_) => CallKind::CopyOut,
            Call::Close => CallKind::Close,
        }
    }

    /// SQL-ish one-line rendering used by [`MockProvider::log`].
    pub fn render(&self) -> String {
        match self {
            Call::Connect => "CONNECT".to_string(),
            Call::Begin { read_only: false } => "BEGIN".to_string(),
            Call::Begin { read_only: true } => "BEGIN READ ONLY".to_string(),
            Call::Commit => "COMMIT".to_string(),
            Call::Rollback => "ROLLBACK".to_string(),
            Call::Savepoint(name) => format!("SAVEPOINT {name}"),
            Call::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {name}"),
            Call::RollbackToSavepoint(name) => format!("ROLLBACK TO SAVEPOINT {name}"),
            Call::Execute { sql, .. } | Call::InsertReturning { sql, .. } | Call::Query { sql, .. } => {
                sql.clone()
            }
            Call::Prepare(sql) => format!("PREPARE {sql}"),
            Call::OpenCursor { .. } => "OPEN CURSOR".to_string(),
            Call::Fetch(_) => "FETCH".to_string(),
            Call::CloseCursor(_) => "CLOSE CURSOR".to_string(),
            Call::CloseStatement(_) => "CLOSE STATEMENT".to_string(),
            Call::CopyOut(sql) => sql.clone(),
            Call::Close => "CLOSE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Connect,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    Execute,
    InsertReturning,
    Query,
    Prepare,
    OpenCursor,
    Fetch,
    CloseCursor,
    CloseStatement,
    CopyOut,
    Close,
}

struct Failure {
    kind: CallKind,
    skip: usize,
    error: DriverError,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    results: VecDeque<ResultSet>,
    generated: VecDeque<Vec<Value>>,
    affected: VecDeque<u64>,
    copies: VecDeque<Vec<Vec<u8>>>,
    failures: Vec<Failure>,
    cursors: AHashMap<u64, VecDeque<Vec<Value>>>,
    statements: AHashMap<u64, String>,
    next_handle: u64,
    open_connections: usize,
}

impl MockState {
    /// Records `call`, then applies a scripted failure for its kind.
    fn record(&mut self, call: Call) -> DriverResult<()> {
        let kind = call.kind();
        self.calls.push(call);
        let Some(pos) = self.failures.iter().position(|f| f.kind == kind) else {
            return Ok(());
        };
        if self.failures[pos].skip > 0 {
            self.failures[pos].skip -= 1;
            return Ok(());
        }
        Err(self.failures.remove(pos).error)
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Connection provider backed by shared scripted state. Clones share state.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next result for `query` or `open_cursor`. An empty queue answers
    /// with an empty result.
    pub fn push_result(&self, result: ResultSet) -> &Self {
        self.state.lock().results.push_back(result);
        self
    }

    /// Next keys for `insert_returning`.
    pub fn push_generated(&self, keys: Vec<Value>) -> &Self {
        self.state.lock().generated.push_back(keys);
        self
    }

    /// Next affected count for `execute` (default 1).
    pub fn push_affected(&self, count: u64) -> &Self {
        self.state.lock().affected.push_back(count);
        self
    }

    /// Chunks of the next `copy_out`.
    pub fn push_copy(&self, chunks: Vec<Vec<u8>>) -> &Self {
        self.state.lock().copies.push_back(chunks);
        self
    }

    /// Fails the next call of `kind`.
    pub fn fail(&self, kind: CallKind, error: DriverError) -> &Self {
        self.fail_after(kind, 0, error)
    }

    /// Fails the call of `kind` that follows `skip` successful ones.
    pub fn fail_after(&self, kind: CallKind, skip: usize, error: DriverError) -> &Self {
        self.state.lock().failures.push(Failure { kind, skip, error });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Rendered calls, without connect/close bookkeeping.
    pub fn log(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| !matches!(c, Call::Connect | Call::Close))
            .map(Call::render)
            .collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state.lock().calls.iter().filter(|c| c.kind() == kind).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn open_statements(&self) -> usize {
        self.state.lock().statements.len()
    }
}

impl ConnectionProvider for MockProvider {
    fn connect(&self) -> DriverResult<Box<dyn Connection>> {
        let mut state = self.state.lock();
        state.record(Call::Connect)?;
        state.open_connections += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// Connection handed out by [`MockProvider`].
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockConnection {
    fn record(&self, call: Call) -> DriverResult<()> {
        self.state.lock().record(call)
    }
}

impl Connection for MockConnection {
    fn begin(&mut self, read_only: bool) -> DriverResult<()> {
        self.record(Call::Begin { read_only })
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.record(Call::Commit)
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.record(Call::Rollback)
    }

    fn savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.record(Call::Savepoint(name.to_string()))
    }

    fn release_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.record(Call::ReleaseSavepoint(name.to_string()))
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.record(Call::RollbackToSavepoint(name.to_string()))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64> {
        let mut state = self.state.lock();
        state.record(Call::Execute {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;
        Ok(state.affected.pop_front().unwrap_or(1))
    }

    fn insert_returning(
        &mut self,
        sql: &str,
        params: &[Value],
        key_columns: &[&str],
    ) -> DriverResult<Vec<Value>> {
        let mut state = self.state.lock();
        state.record(Call::InsertReturning {
            sql: sql.to_string(),
            params: params.to_vec(),
            keys: key_columns.iter().map(|k| (*k).to_string()).collect(),
        })?;
        state
            .generated
            .pop_front()
            .ok_or_else(|| DriverError::new("no generated keys scripted"))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<ResultSet> {
        let mut state = self.state.lock();
        state.record(Call::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;
        Ok(state.results.pop_front().unwrap_or_default())
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<StatementId> {
        let mut state = self.state.lock();
        state.record(Call::Prepare(sql.to_string()))?;
        let id = state.handle();
        state.statements.insert(id, sql.to_string());
        Ok(StatementId(id))
    }

    fn open_cursor(
        &mut self,
        statement: StatementId,
        params: &[Value],
        fetch_size: usize,
    ) -> DriverResult<(CursorId, Vec<ColumnMeta>)> {
        let mut state = self.state.lock();
        state.record(Call::OpenCursor {
            statement: statement.0,
            params: params.to_vec(),
            fetch_size,
        })?;
        if !state.statements.contains_key(&statement.0) {
            return Err(DriverError::new(format!("unknown statement {}", statement.0)));
        }
        let result = state.results.pop_front().unwrap_or_default();
        let id = state.handle();
        state.cursors.insert(id, result.rows.into());
        Ok((CursorId(id), result.columns))
    }

    fn fetch(&mut self, cursor: CursorId) -> DriverResult<Option<Vec<Value>>> {
        let mut state = self.state.lock();
        state.record(Call::Fetch(cursor.0))?;
        match state.cursors.get_mut(&cursor.0) {
            Some(rows) => Ok(rows.pop_front()),
            None => Err(DriverError::new(format!("unknown cursor {}", cursor.0))),
        }
    }

    fn close_cursor(&mut self, cursor: CursorId) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.record(Call::CloseCursor(cursor.0))?;
        state.cursors.remove(&cursor.0);
        Ok(())
    }

    fn close_statement(&mut self, statement: StatementId) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.record(Call::CloseStatement(statement.0))?;
        state.statements.remove(&statement.0);
        Ok(())
    }

    fn copy_out<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn CopyOutSource + 'c>> {
        let mut state = self.state.lock();
        state.record(Call::CopyOut(sql.to_string()))?;
        let chunks = state.copies.pop_front().unwrap_or_default();
        Ok(Box::new(MockCopy {
            chunks: chunks.into(),
        }))
    }

    fn close(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !self.closed {
            self.closed = true;
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        state.record(Call::Close)
    }
}

struct MockCopy {
    chunks: VecDeque<Vec<u8>>,
}

impl CopyOutSource for MockCopy {
    fn next_chunk(&mut self) -> DriverResult<Option<Vec<u8>>> {
        Ok(self.chunks.pop_front())
    }
}

/// Binary COPY chunk builders.
pub mod copy {
    const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

    /// First chunk: signature, flags and an empty header extension.
    pub fn header() -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes());
        out
    }

    /// One row frame; `None` fields are NULL.
    pub fn frame(fields: &[Option<&[u8]>]) -> Vec<u8> {
        let mut out = (fields.len() as i16).to_be_bytes().to_vec();
        for field in fields {
            match field {
                Some(bytes) => {
                    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                None => out.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        out
    }

    pub fn trailer() -> Vec<u8> {
        (-1i16).to_be_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failure_fires_once_after_skips() {
        let provider = MockProvider::new();
        provider.fail_after(CallKind::Execute, 1, DriverError::new("boom"));
        let mut conn = provider.connect().unwrap();

        assert_eq!(conn.execute("A", &[]).unwrap(), 1);
        assert_eq!(conn.execute("B", &[]).unwrap_err().message, "boom");
        assert!(conn.execute("C", &[]).is_ok());
        assert_eq!(provider.log(), vec!["A", "B", "C"]);
    }

    #[test]
    fn cursors_serve_scripted_rows() {
        let provider = MockProvider::new();
        provider.push_result(
            ResultSet::new(vec![ColumnMeta::new("n")])
                .with_row(vec![Value::Int64(1)])
                .with_row(vec![Value::Int64(2)]),
        );
        let mut conn = provider.connect().unwrap();
        let stmt = conn.prepare("SELECT n FROM t").unwrap();
        let (cursor, columns) = conn.open_cursor(stmt, &[], 10).unwrap();

        assert_eq!(columns.len(), 1);
        assert_eq!(conn.fetch(cursor).unwrap(), Some(vec![Value::Int64(1)]));
        assert_eq!(conn.fetch(cursor).unwrap(), Some(vec![Value::Int64(2)]));
        assert_eq!(conn.fetch(cursor).unwrap(), None);

        conn.close_cursor(cursor).unwrap();
        conn.close_statement(stmt).unwrap();
        assert_eq!(provider.open_cursors(), 0);
        assert_eq!(provider.open_statements(), 0);
    }

    #[test]
    fn connections_are_counted() {
        let provider = MockProvider::new();
        let mut conn = provider.connect().unwrap();
        assert_eq!(provider.open_connections(), 1);
        conn.close().unwrap();
        assert_eq!(provider.open_connections(), 0);
    }
}
