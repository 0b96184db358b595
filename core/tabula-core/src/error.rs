//! Error types for tabula.
//!
//! All public APIs return `TabulaResult<T>`; library code does not panic.

use std::fmt;
use thiserror::Error;

use crate::driver::DriverError;

/// Where a statement-level failure happened: the owning transaction's display
/// identity, the SQL text and the rendered parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementContext {
    pub transaction: String,
    pub sql: Option<String>,
    pub params: Vec<String>,
}

impl StatementContext {
    pub fn new(transaction: impl Into<String>) -> Self {
        Self {
            transaction: transaction.into(),
            sql: None,
            params: Vec::new(),
        }
    }

    pub fn with_statement(mut self, sql: impl Into<String>, params: Vec<String>) -> Self {
        self.sql = Some(sql.into());
        self.params = params;
        self
    }
}

impl fmt::Display for StatementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.transaction)?;
        if let Some(sql) = &self.sql {
            write!(f, " SQL: {sql}")?;
            if !self.params.is_empty() {
                write!(f, " params: [{}]", self.params.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Unified error type for all tabula operations.
#[derive(Debug, Error)]
pub enum TabulaError {
    /// Integrity-class driver failure (duplicate key, foreign key, check)
    #[error("constraint violation: {message} {context}")]
    ConstraintViolation {
        message: String,
        sqlstate: Option<String>,
        context: StatementContext,
    },

    /// Other driver failures and transaction invariant violations
    #[error("database error: {message} {context}")]
    Database {
        message: String,
        context: StatementContext,
    },

    /// Binding discovery or reflector construction failure
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Malformed bulk frame or failed record construction
    #[error("decode error: {message} (raw: {})", hex(.bytes))]
    Decode { message: String, bytes: Vec<u8> },

    /// Column lookup on a row failed
    #[error("column '{column}': {reason}")]
    Column { column: String, reason: String },

    /// Type mismatch between expected and actual values
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A row-level failure raised while a statement's results were consumed
    #[error("{source} {context}")]
    Statement {
        source: Box<TabulaError>,
        context: StatementContext,
    },

    /// A primary failure with release errors collected while unwinding
    #[error("{primary} (suppressed: {})", join_suppressed(.suppressed))]
    Suppressed {
        primary: Box<TabulaError>,
        suppressed: Vec<TabulaError>,
    },
}

/// Result type alias for all tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

impl TabulaError {
    /// Classifies a driver error, attaching the statement context.
    pub fn from_driver(err: DriverError, context: StatementContext) -> Self {
        if err.is_integrity_violation() {
            TabulaError::ConstraintViolation {
                message: err.message,
                sqlstate: err.sqlstate,
                context,
            }
        } else {
            TabulaError::Database {
                message: err.message,
                context,
            }
        }
    }

    pub fn database(message: impl Into<String>, context: StatementContext) -> Self {
        TabulaError::Database {
            message: message.into(),
            context,
        }
    }

    pub fn decode(message: impl Into<String>, bytes: &[u8]) -> Self {
        TabulaError::Decode {
            message: message.into(),
            bytes: bytes.to_vec(),
        }
    }

    /// Attaches `other` as suppressed detail, keeping `self` as the primary.
    pub fn with_suppressed(self, other: TabulaError) -> Self {
        match self {
            TabulaError::Suppressed {
                primary,
                mut suppressed,
            } => {
                suppressed.push(other);
                TabulaError::Suppressed {
                    primary,
                    suppressed,
                }
            }
            primary => TabulaError::Suppressed {
                primary: Box::new(primary),
                suppressed: vec![other],
            },
        }
    }

    /// Tags a failure with the statement it happened under. Errors that
    /// already carry a context are returned as they are.
    pub fn with_context(self, context: StatementContext) -> Self {
        match self {
            TabulaError::ConstraintViolation { .. }
            | TabulaError::Database { .. }
            | TabulaError::Statement { .. } => self,
            TabulaError::Suppressed {
                primary,
                suppressed,
            } => TabulaError::Suppressed {
                primary: Box::new((*primary).with_context(context)),
                suppressed,
            },
            other => TabulaError::Statement {
                source: Box::new(other),
                context,
            },
        }
    }

    pub fn with_all_suppressed(self, others: impl IntoIterator<Item = TabulaError>) -> Self {
        others.into_iter().fold(self, TabulaError::with_suppressed)
    }

    /// The error that caused the failure, looking through suppressed detail
    /// and statement tags.
    pub fn primary(&self) -> &TabulaError {
        match self {
            TabulaError::Suppressed { primary, .. } => primary.primary(),
            TabulaError::Statement { source, .. } => source.primary(),
            other => other,
        }
    }

    pub fn suppressed(&self) -> &[TabulaError] {
        match self {
            TabulaError::Suppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.primary(), TabulaError::ConstraintViolation { .. })
    }

    pub fn is_decode(&self) -> bool {
        matches!(self.primary(), TabulaError::Decode { .. })
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self.primary(), TabulaError::Mapping(_))
    }
}

impl From<serde_json::Error> for TabulaError {
    fn from(err: serde_json::Error) -> Self {
        TabulaError::Serialization(err.to_string())
    }
}

fn hex(bytes: &[u8]) -> String {
    const LIMIT: usize = 64;
    let mut out: String = bytes
        .iter()
        .take(LIMIT)
        .map(|b| format!("{b:02x}"))
        .collect();
    if bytes.len() > LIMIT {
        out.push_str(&format!("…(+{} bytes)", bytes.len() - LIMIT));
    }
    out
}

fn join_suppressed(errors: &[TabulaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
