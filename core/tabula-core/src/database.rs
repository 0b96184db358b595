//! Database handle, the entry point for transactions and streams.

use crate::config::TabulaConfig;
use crate::driver::ConnectionProvider;
use crate::error::{StatementContext, TabulaError, TabulaResult};
use crate::stream::StreamBuilder;
use crate::transaction::Transaction;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Cheap-to-clone handle over a connection provider.
#[derive(Clone)]
pub struct Database {
    provider: Arc<dyn ConnectionProvider>,
    config: Arc<TabulaConfig>,
}

impl Database {
    /// Database with default configuration.
    pub fn new(provider: impl ConnectionProvider + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
            config: Arc::new(TabulaConfig::default()),
        }
    }

    pub fn with_config(
        provider: impl ConnectionProvider + 'static,
        config: TabulaConfig,
    ) -> TabulaResult<Self> {
        config.validate()?;
        Ok(Self {
            provider: Arc::new(provider),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &TabulaConfig {
        &self.config
    }

    /// Opens a root transaction on a fresh connection.
    pub fn begin(&self, read_only: bool) -> TabulaResult<Transaction<'static>> {
        debug!(read_only, "acquiring connection");
        let conn = self
            .provider
            .connect()
            .map_err(|e| TabulaError::from_driver(e, StatementContext::new("<connect>")))?;
        Transaction::begin_root(conn, read_only, Arc::clone(&self.config))
    }

    /// Lazy stream over `sql`, run on its own read-only transaction.
    pub fn stream(&self, sql: impl Into<String>) -> StreamBuilder<'_> {
        StreamBuilder::new(self, sql.into())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::testing::{CallKind, MockProvider};

    #[test]
    fn invalid_config_is_rejected() {
        let err = Database::with_config(
            MockProvider::new(),
            TabulaConfig::new().with_stream_fetch_size(0),
        )
        .unwrap_err();
        assert!(matches!(err, TabulaError::Config(_)));
    }

    #[test]
    fn connect_failure_is_classified() {
        let provider = MockProvider::new();
        provider.fail(
            CallKind::Connect,
            DriverError::new("too many clients").with_sqlstate("53300"),
        );
        let err = Database::new(provider.clone()).begin(false).unwrap_err();
        assert!(err.to_string().contains("too many clients"));
        assert!(err.to_string().contains("<connect>"));
        assert!(!err.is_constraint_violation());
    }

    #[test]
    fn failed_begin_closes_connection() {
        let provider = MockProvider::new();
        provider.fail(CallKind::Begin, DriverError::new("refused"));
        let db = Database::new(provider.clone());

        assert!(db.begin(true).is_err());
        assert_eq!(provider.open_connections(), 0);
        assert_eq!(provider.count(CallKind::Close), 1);
    }
}
