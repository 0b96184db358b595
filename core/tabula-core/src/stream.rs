//! Lazy query streams.
//!
//! A [`QueryStream`] pulls rows one at a time from a server-side cursor. It
//! runs on its own read-only root transaction and connection, independent of
//! any transaction the caller holds. Cursor, statement and transaction are
//! released together, in reverse order of acquisition, when the stream is
//! exhausted, fails or is dropped.

use crate::api::Params;
use crate::database::Database;
use crate::driver::{CursorId, StatementId};
use crate::entity::{Entity, EntityBinding};
use crate::error::{StatementContext, TabulaError, TabulaResult};
use crate::reflect::{Record, RecordMapper};
use crate::row::{ColumnResolver, Row};
use crate::transaction::Transaction;
use crate::value::{TryIntoValue, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

type RowMapper<T> = Box<dyn FnMut(&Row, &Transaction<'_>) -> TabulaResult<T> + Send>;

/// Builder returned by [`Database::stream`].
pub struct StreamBuilder<'d> {
    db: &'d Database,
    sql: String,
    params: Params,
}

impl<'d> StreamBuilder<'d> {
    pub(crate) fn new(db: &'d Database, sql: String) -> Self {
        Self {
            db,
            sql,
            params: Params::new(),
        }
    }

    pub fn bind<V: TryIntoValue>(mut self, value: V) -> Self {
        self.params.bind(value);
        self
    }

    pub fn param<V: TryIntoValue>(mut self, name: &str, value: V) -> Self {
        self.params.param(name, value);
        self
    }

    /// Opens the stream, mapping each row with `f`.
    pub fn open<T, F>(self, mut f: F) -> TabulaResult<QueryStream<T>>
    where
        F: FnMut(&Row) -> TabulaResult<T> + Send + 'static,
    {
        let mapper: RowMapper<T> = Box::new(move |row: &Row, _: &Transaction<'_>| f(row));
        self.open_with(mapper)
    }

    /// Opens the stream, mapping each row with a compiled record mapper.
    pub fn open_records<T: Record + 'static>(
        self,
        mapper: RecordMapper<T>,
    ) -> TabulaResult<QueryStream<T>> {
        let mapper: RowMapper<T> =
            Box::new(move |row: &Row, _: &Transaction<'_>| mapper.map(row));
        self.open_with(mapper)
    }

    /// Opens the stream, injecting each row into a fresh entity.
    pub fn open_entities<E: Entity>(self) -> TabulaResult<QueryStream<E>> {
        let binding = EntityBinding::<E>::of()?;
        let mapper: RowMapper<E> =
            Box::new(move |row: &Row, tx: &Transaction<'_>| binding.load(row, tx));
        self.open_with(mapper)
    }

    fn open_with<T>(self, mapper: RowMapper<T>) -> TabulaResult<QueryStream<T>> {
        let (sql, params) = self.params.resolve(&self.sql).map_err(|e| {
            TabulaError::database(
                e.to_string(),
                StatementContext::new("<stream>").with_statement(&self.sql, Vec::new()),
            )
        })?;

        let tx = self.db.begin(true)?;
        let mut stream = QueryStream {
            tx: Some(tx),
            statement: None,
            cursor: None,
            resolver: None,
            sql,
            mapper,
            done: false,
        };
        if let Err(err) = stream.acquire(&params) {
            stream.done = true;
            return Err(stream.fail(err));
        }
        Ok(stream)
    }
}

/// Single-pass iterator over a live cursor.
pub struct QueryStream<T> {
    tx: Option<Transaction<'static>>,
    statement: Option<StatementId>,
    cursor: Option<CursorId>,
    resolver: Option<Arc<ColumnResolver>>,
    sql: String,
    mapper: RowMapper<T>,
    done: bool,
}

impl<T> QueryStream<T> {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether cursor, statement and transaction have been released.
    pub fn is_released(&self) -> bool {
        self.tx.is_none()
    }

    fn acquire(&mut self, params: &[Value]) -> TabulaResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(self.closed());
        };
        let statement = tx.prepare(&self.sql)?;
        self.statement = Some(statement);
        let (cursor, columns) = tx.open_cursor(&self.sql, statement, params)?;
        self.cursor = Some(cursor);
        self.resolver = Some(Arc::new(ColumnResolver::new(columns)));
        debug!(tx = %tx.display_id(), sql = %self.sql, "stream opened");
        Ok(())
    }

    fn advance(&mut self) -> TabulaResult<Option<T>> {
        let (Some(tx), Some(cursor), Some(resolver)) =
            (self.tx.as_ref(), self.cursor, self.resolver.as_ref())
        else {
            return Err(self.closed());
        };
        tx.ensure_open()?;
        let Some(values) = tx.fetch(&self.sql, cursor)? else {
            return Ok(None);
        };
        let row = Row::new(values, Arc::clone(resolver))
            .and_then(|row| (self.mapper)(&row, tx))
            .map_err(|e| e.with_context(tx.context(&self.sql, &[])))?;
        Ok(Some(row))
    }

    /// Releases everything still held; returns the failures.
    fn release(&mut self) -> Vec<TabulaError> {
        let mut errors = Vec::new();
        let Some(tx) = self.tx.take() else {
            return errors;
        };
        if let Some(cursor) = self.cursor.take()
            && let Err(err) = tx.close_cursor(&self.sql, cursor)
        {
            errors.push(err);
        }
        if let Some(statement) = self.statement.take()
            && let Err(err) = tx.close_statement(&self.sql, statement)
        {
            errors.push(err);
        }
        if let Err(err) = tx.close() {
            errors.push(err);
        }
        debug!(tx = %tx.display_id(), failures = errors.len(), "stream released");
        errors
    }

    fn fail(&mut self, err: TabulaError) -> TabulaError {
        let released = self.release();
        err.with_all_suppressed(released)
    }

    fn closed(&self) -> TabulaError {
        TabulaError::database(
            "stream is closed",
            StatementContext::new("<stream>").with_statement(&self.sql, Vec::new()),
        )
    }
}

impl<T> Iterator for QueryStream<T> {
    type Item = TabulaResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                let mut errors = self.release().into_iter();
                errors.next().map(|first| Err(first.with_all_suppressed(errors)))
            }
            Err(err) => {
                self.done = true;
                Some(Err(self.fail(err)))
            }
        }
    }
}

impl<T> fmt::Debug for QueryStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStream")
            .field("sql", &self.sql)
            .field("tx", &self.tx.as_ref().map(|tx| tx.display_id()))
            .field("done", &self.done)
            .finish()
    }
}

impl<T> Drop for QueryStream<T> {
    fn drop(&mut self) {
        for err in self.release() {
            warn!(sql = %self.sql, error = %err, "stream release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ColumnMeta, DriverError, ResultSet};
    use crate::testing::{CallKind, MockProvider};

    fn numbers(n: i64) -> ResultSet {
        (1..=n).fold(ResultSet::new(vec![ColumnMeta::new("n")]), |rs, i| {
            rs.with_row(vec![Value::Int64(i)])
        })
    }

    fn setup(rows: i64) -> (MockProvider, Database) {
        let provider = MockProvider::new();
        provider.push_result(numbers(rows));
        let db = Database::new(provider.clone());
        (provider, db)
    }

    #[test]
    fn yields_in_order_then_releases_in_reverse() {
        let (provider, db) = setup(2);
        let stream = db
            .stream("SELECT n FROM t")
            .open(|row| row.get::<i64>("n"))
            .unwrap();

        let items: Vec<i64> = stream.map(Result::unwrap).collect();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(
            provider.log(),
            vec![
                "BEGIN READ ONLY",
                "PREPARE SELECT n FROM t",
                "OPEN CURSOR",
                "FETCH",
                "FETCH",
                "FETCH",
                "CLOSE CURSOR",
                "CLOSE STATEMENT",
                "COMMIT",
            ]
        );
        assert_eq!(provider.open_connections(), 0);
    }

    #[test]
    fn early_drop_releases_everything() {
        let (provider, db) = setup(5);
        let mut stream = db.stream("SELECT n FROM t").open(|row| row.get::<i64>("n")).unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), 1);
        drop(stream);

        assert_eq!(provider.open_cursors(), 0);
        assert_eq!(provider.open_statements(), 0);
        assert_eq!(provider.open_connections(), 0);
        assert_eq!(provider.count(CallKind::Fetch), 1);
    }

    #[test]
    fn mapper_failure_ends_the_stream() {
        let (provider, db) = setup(3);
        let mut stream = db
            .stream("SELECT n FROM t")
            .open(|row| row.get::<String>("n"))
            .unwrap();

        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
        assert!(stream.is_released());
        assert_eq!(provider.open_connections(), 0);
    }

    #[test]
    fn release_failure_is_suppressed_under_primary() {
        let (provider, db) = setup(1);
        provider.fail(CallKind::Fetch, DriverError::new("connection reset"));
        provider.fail(CallKind::CloseCursor, DriverError::new("cursor gone"));
        let mut stream = db.stream("SELECT n FROM t").open(|row| row.get::<i64>("n")).unwrap();

        let err = stream.next().unwrap().unwrap_err();
        assert!(err.primary().to_string().contains("connection reset"));
        assert_eq!(err.suppressed().len(), 1);
        assert!(err.suppressed()[0].to_string().contains("cursor gone"));
        assert_eq!(provider.open_connections(), 0);
    }

    #[test]
    fn release_failure_after_exhaustion_is_yielded_once() {
        let (provider, db) = setup(1);
        provider.fail(CallKind::CloseStatement, DriverError::new("busy"));
        let mut stream = db.stream("SELECT n FROM t").open(|row| row.get::<i64>("n")).unwrap();

        assert_eq!(stream.next().unwrap().unwrap(), 1);
        assert!(stream.next().unwrap().unwrap_err().to_string().contains("busy"));
        assert!(stream.next().is_none());
    }

    #[test]
    fn open_failure_releases_acquired_resources() {
        let (provider, db) = setup(1);
        provider.fail(CallKind::OpenCursor, DriverError::new("syntax error"));
        let err = db
            .stream("SELEC n FROM t")
            .open(|row| row.get::<i64>("n"))
            .unwrap_err();

        assert!(err.to_string().contains("syntax error"));
        assert_eq!(provider.open_statements(), 0);
        assert_eq!(provider.open_connections(), 0);
    }

    #[test]
    fn unbound_parameter_fails_before_connecting() {
        let (provider, db) = setup(1);
        let err = db
            .stream("SELECT n FROM t WHERE n > :min")
            .open(|row| row.get::<i64>("n"))
            .unwrap_err();
        assert!(err.to_string().contains(":min"));
        assert_eq!(provider.count(CallKind::Connect), 0);
    }

    #[test]
    fn named_parameters_reach_the_cursor() {
        let (provider, db) = setup(1);
        let stream = db
            .stream("SELECT n FROM t WHERE n > :min")
            .param("min", 0i64)
            .open(|row| row.get::<i64>("n"))
            .unwrap();
        assert_eq!(stream.count(), 1);

        let opened = provider
            .calls()
            .into_iter()
            .find(|c| c.kind() == CallKind::OpenCursor)
            .unwrap();
        assert_eq!(
            opened,
            crate::testing::Call::OpenCursor {
                statement: 1,
                params: vec![Value::Int64(0)],
                fetch_size: 256,
            }
        );
    }
}
