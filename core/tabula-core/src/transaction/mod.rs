//! Units-of-work.
//!
//! A root [`Transaction`] owns one connection. [`Transaction::begin_nested`]
//! opens a child on the same connection behind a savepoint; the child
//! borrows its parent, so children always end before their parents. Every
//! transaction in a chain shares the root's connection and identity cache.
//!
//! ```text
//! root    BEGIN ─────────────────────────────────────── COMMIT | ROLLBACK
//! child         SAVEPOINT sp_2 ──── RELEASE sp_2
//!                                   | ROLLBACK TO sp_2; RELEASE sp_2
//! ```
//!
//! A transaction that is dropped without an explicit end commits if it is
//! read-only and rolls back otherwise.

mod crud;
mod identity_cache;
mod sequence;

pub use crud::Select;
pub use identity_cache::{CacheStats, IdentityCache};
pub use sequence::TransactionSequence;

use crate::api::{Execute, Query};
use crate::config::TabulaConfig;
use crate::driver::{ColumnMeta, Connection, CursorId, DriverResult, StatementId};
use crate::entity::IdentityKey;
use crate::error::{StatementContext, TabulaError, TabulaResult};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by every transaction of one chain.
struct Chain {
    conn: Mutex<Option<Box<dyn Connection>>>,
    cache: Mutex<IdentityCache>,
    config: Arc<TabulaConfig>,
}

#[derive(Debug, Default)]
struct TxState {
    finished: bool,
    open_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

/// A unit-of-work on one connection.
///
/// Methods take `&self`; per-transaction state sits behind a mutex so a
/// transaction can be shared by reference, but a chain is meant to be
/// driven by one caller at a time.
pub struct Transaction<'p> {
    id: u64,
    display: String,
    read_only: bool,
    savepoint: Option<String>,
    parent: Option<&'p Transaction<'p>>,
    chain: Arc<Chain>,
    state: Mutex<TxState>,
}

impl Transaction<'static> {
    /// Starts a root transaction on `conn`. The connection is closed again
    /// if `BEGIN` fails.
    pub(crate) fn begin_root(
        mut conn: Box<dyn Connection>,
        read_only: bool,
        config: Arc<TabulaConfig>,
    ) -> TabulaResult<Self> {
        let id = TransactionSequence::global().next();
        let display_id = format!("tx#{id}");
        let sql = if read_only { "BEGIN READ ONLY" } else { "BEGIN" };

        if let Err(err) = conn.begin(read_only) {
            let context = StatementContext::new(&display_id).with_statement(sql, Vec::new());
            let err = TabulaError::from_driver(err, context.clone());
            return Err(match conn.close() {
                Ok(()) => err,
                Err(close) => err.with_suppressed(TabulaError::from_driver(close, context)),
            });
        }
        info!(tx = %display_id, read_only, "transaction started");

        let capacity = config.identity_cache_capacity;
        Ok(Self {
            id,
            display: display_id,
            read_only,
            savepoint: None,
            parent: None,
            chain: Arc::new(Chain {
                conn: Mutex::new(Some(conn)),
                cache: Mutex::new(IdentityCache::new(capacity)),
                config,
            }),
            state: Mutex::new(TxState::default()),
        })
    }
}

impl<'p> Transaction<'p> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `tx#<id>`, followed by the parent's display identity when nested.
    pub fn display_id(&self) -> &str {
        &self.display
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    pub fn parent(&self) -> Option<&Transaction<'p>> {
        self.parent
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn open_children(&self) -> usize {
        self.state.lock().open_children
    }

    pub fn config(&self) -> &TabulaConfig {
        &self.chain.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.chain.cache.lock().stats()
    }

    /// Opens a child transaction behind a fresh savepoint. The child
    /// inherits this transaction's read-only flag.
    pub fn begin_nested(&self) -> TabulaResult<Transaction<'_>> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(self.invariant("cannot begin a nested transaction: transaction is finished"));
        }

        let id = TransactionSequence::global().next();
        let name = format!("{}_{id}", self.chain.config.savepoint_prefix);
        self.with_connection(&format!("SAVEPOINT {name}"), &[], |conn| {
            conn.savepoint(&name)
        })?;
        state.open_children += 1;
        drop(state);

        let display_id = format!("tx#{id}({})", self.display);
        debug!(tx = %display_id, savepoint = %name, "nested transaction started");
        Ok(Transaction {
            id,
            display: display_id,
            read_only: self.read_only,
            savepoint: Some(name),
            parent: Some(self),
            chain: Arc::clone(&self.chain),
            state: Mutex::new(TxState::default()),
        })
    }

    /// Commits. Fails without changing anything while a child is open.
    pub fn commit(&self) -> TabulaResult<()> {
        self.finish(Outcome::Commit)
    }

    /// Rolls back. Fails without changing anything while a child is open.
    pub fn rollback(&self) -> TabulaResult<()> {
        self.finish(Outcome::Rollback)
    }

    /// Ends the transaction unless it already ended: read-only transactions
    /// commit, writable ones roll back.
    pub fn close(&self) -> TabulaResult<()> {
        if self.is_finished() {
            return Ok(());
        }
        if self.read_only {
            self.finish(Outcome::Commit)
        } else {
            self.finish(Outcome::Rollback)
        }
    }

    /// Builder for a statement returning rows.
    pub fn query(&self, sql: impl Into<String>) -> Query<'_> {
        Query::new(self, sql)
    }

    /// Builder for a statement returning an affected-row count.
    pub fn execute(&self, sql: impl Into<String>) -> Execute<'_> {
        Execute::new(self, sql)
    }

    fn finish(&self, outcome: Outcome) -> TabulaResult<()> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(self.invariant("transaction is already finished"));
        }
        if state.open_children > 0 {
            return Err(self.invariant(&format!(
                "cannot end transaction with {} open nested transaction(s)",
                state.open_children
            )));
        }

        let result = match &self.savepoint {
            None => self.end_root(outcome),
            Some(name) => self.end_savepoint(name, outcome),
        };
        state.finished = true;
        drop(state);

        if let Some(parent) = self.parent {
            let mut parent_state = parent.state.lock();
            parent_state.open_children = parent_state.open_children.saturating_sub(1);
        }
        result
    }

    fn end_root(&self, outcome: Outcome) -> TabulaResult<()> {
        let sql = match outcome {
            Outcome::Commit => "COMMIT",
            Outcome::Rollback => "ROLLBACK",
        };
        let Some(mut conn) = self.chain.conn.lock().take() else {
            return Err(self.invariant("connection already released"));
        };

        debug!(tx = %self.display, sql, "ending transaction");
        let ended = match outcome {
            Outcome::Commit => conn.commit(),
            Outcome::Rollback => conn.rollback(),
        }
        .map_err(|e| TabulaError::from_driver(e, self.context(sql, &[])));
        let closed = conn
            .close()
            .map_err(|e| TabulaError::from_driver(e, self.context("<close connection>", &[])));
        self.chain.cache.lock().clear();
        info!(tx = %self.display, outcome = sql, "transaction ended");

        match (ended, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(err), Err(close)) => Err(err.with_suppressed(close)),
        }
    }

    fn end_savepoint(&self, name: &str, outcome: Outcome) -> TabulaResult<()> {
        if outcome == Outcome::Rollback {
            // Entities cached since the savepoint may reflect reverted writes.
            self.chain.cache.lock().clear();
        }
        let reverted = match outcome {
            Outcome::Commit => Ok(()),
            Outcome::Rollback => self.with_connection(&format!("ROLLBACK TO SAVEPOINT {name}"), &[], |conn| {
                conn.rollback_to_savepoint(name)
            }),
        };
        let released = self.with_connection(&format!("RELEASE SAVEPOINT {name}"), &[], |conn| {
            conn.release_savepoint(name)
        });
        debug!(tx = %self.display, savepoint = name, ?outcome, "nested transaction ended");

        match (reverted, released) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(err), Err(release)) => Err(err.with_suppressed(release)),
        }
    }

    pub(crate) fn ensure_open(&self) -> TabulaResult<()> {
        if self.is_finished() {
            return Err(self.invariant("transaction is finished"));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self, sql: &str) -> TabulaResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(TabulaError::database(
                "read-only transaction cannot modify data",
                self.context(sql, &[]),
            ));
        }
        Ok(())
    }

    pub(crate) fn context(&self, sql: &str, params: &[Value]) -> StatementContext {
        StatementContext::new(&self.display)
            .with_statement(sql, params.iter().map(Value::render).collect())
    }

    fn invariant(&self, message: &str) -> TabulaError {
        TabulaError::database(message, StatementContext::new(&self.display))
    }

    /// Runs `f` on the chain's connection, logging the statement and
    /// attaching context to driver failures.
    pub(crate) fn with_connection<R>(
        &self,
        sql: &str,
        params: &[Value],
        f: impl FnOnce(&mut dyn Connection) -> DriverResult<R>,
    ) -> TabulaResult<R> {
        if self.chain.config.log_parameters {
            let rendered: Vec<String> = params.iter().map(Value::render).collect();
            debug!(tx = %self.display, sql, params = %rendered.join(", "), "statement");
        } else {
            debug!(tx = %self.display, sql, params = params.len(), "statement");
        }
        self.connection_scope(sql, |conn| {
            f(conn).map_err(|e| TabulaError::from_driver(e, self.context(sql, params)))
        })
    }

    /// Lends the chain's connection to `f` without logging.
    pub(crate) fn connection_scope<R>(
        &self,
        sql: &str,
        f: impl FnOnce(&mut dyn Connection) -> TabulaResult<R>,
    ) -> TabulaResult<R> {
        let mut guard = self.chain.conn.lock();
        let conn = guard
            .as_deref_mut()
            .ok_or_else(|| TabulaError::database("connection already released", self.context(sql, &[])))?;
        f(conn)
    }

    pub(crate) fn run_execute(&self, sql: &str, params: &[Value]) -> TabulaResult<u64> {
        self.ensure_writable(sql)?;
        self.with_connection(sql, params, |conn| conn.execute(sql, params))
    }

    pub(crate) fn run_query(&self, sql: &str, params: &[Value]) -> TabulaResult<crate::driver::ResultSet> {
        self.ensure_open()?;
        self.with_connection(sql, params, |conn| conn.query(sql, params))
    }

    pub(crate) fn prepare(&self, sql: &str) -> TabulaResult<StatementId> {
        self.ensure_open()?;
        self.with_connection(sql, &[], |conn| conn.prepare(sql))
    }

    pub(crate) fn open_cursor(
        &self,
        sql: &str,
        statement: StatementId,
        params: &[Value],
    ) -> TabulaResult<(CursorId, Vec<ColumnMeta>)> {
        self.ensure_open()?;
        let fetch_size = self.chain.config.stream_fetch_size;
        self.with_connection(sql, params, |conn| {
            conn.open_cursor(statement, params, fetch_size)
        })
    }

    pub(crate) fn fetch(&self, sql: &str, cursor: CursorId) -> TabulaResult<Option<Vec<Value>>> {
        self.connection_scope(sql, |conn| {
            conn.fetch(cursor)
                .map_err(|e| TabulaError::from_driver(e, self.context(sql, &[])))
        })
    }

    pub(crate) fn close_cursor(&self, sql: &str, cursor: CursorId) -> TabulaResult<()> {
        self.with_connection(sql, &[], |conn| conn.close_cursor(cursor))
    }

    pub(crate) fn close_statement(&self, sql: &str, statement: StatementId) -> TabulaResult<()> {
        self.with_connection(sql, &[], |conn| conn.close_statement(statement))
    }

    pub(crate) fn cached<E: Send + Sync + 'static>(&self, key: &IdentityKey) -> Option<Arc<E>> {
        self.chain.cache.lock().get::<E>(key)
    }

    pub(crate) fn cached_loaded<E: Send + Sync + 'static>(&self, key: &IdentityKey) -> Option<Arc<E>> {
        self.chain.cache.lock().get_loaded::<E>(key)
    }

    pub(crate) fn cache_entity<E: Send + Sync + 'static>(&self, key: IdentityKey, entity: Arc<E>, loaded: bool) {
        self.chain.cache.lock().put(key, entity, loaded);
    }

    pub(crate) fn evict<E: 'static>(&self, key: &IdentityKey) {
        self.chain.cache.lock().invalidate::<E>(key);
    }
}

impl fmt::Display for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.display)
            .field("read_only", &self.read_only)
            .field("savepoint", &self.savepoint)
            .field("finished", &state.finished)
            .field("open_children", &state.open_children)
            .finish()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(tx = %self.display, error = %err, "implicit transaction end failed");
        }
    }
}

#[cfg(test)]
mod tests;
