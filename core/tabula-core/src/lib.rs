//! # tabula: transactional relational data access
//!
//! tabula is a thin access layer over an injected SQL driver. It does not plan
//! queries or speak a wire protocol of its own; it owns the bookkeeping that
//! usually hides inside a driver or ORM.
//!
//! ## Features
//!
//! - **Nested units-of-work**: root transactions plus savepoint-backed children
//!   of any depth, with guaranteed release on drop
//! - **Entity mapping**: declared bindings for mutable row types, generated
//!   keys, lifecycle hooks and a per-transaction identity cache
//! - **Structural records**: column-name templates with holes aligned against
//!   nested record shapes, compiled once into flat row mappers
//! - **Lazy streams**: single-pass cursors over a dedicated read-only
//!   transaction
//! - **Binary COPY**: decoding of `COPY … TO STDOUT WITH (FORMAT binary)`
//!   exports into raw typed tuples
//!
//! ## Quick start
//!
//! ```rust
//! # #[cfg(feature = "testing")]
//! # fn main() -> tabula_core::TabulaResult<()> {
//! use tabula_core::Database;
//! use tabula_core::testing::MockProvider;
//!
//! let provider = MockProvider::new();
//! let db = Database::new(provider.clone());
//!
//! let tx = db.begin(false)?;
//! tx.execute("UPDATE users SET active = :active WHERE id = :id")
//!     .param("active", true)
//!     .param("id", 7i64)
//!     .run()?;
//!
//! let inner = tx.begin_nested()?;
//! inner.execute("DELETE FROM sessions WHERE user_id = ?").bind(7i64).run()?;
//! inner.rollback()?;
//!
//! tx.commit()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "testing"))]
//! # fn main() {}
//! ```
//!
//! ## Modules
//!
//! - [`transaction`]: units-of-work, savepoints, identity cache
//! - [`api`]: statement builders and named parameters
//! - [`entity`]: entity bindings and relation stubs
//! - [`reflect`]: record shapes, reflectors and row mappers
//! - [`row`]: rows and column-name resolution
//! - [`stream`]: lazy query streams
//! - [`bulk`]: binary COPY decoding
//! - [`driver`]: the connection seam implemented by drivers
//! - `testing`: a scripted in-memory driver, behind the `testing` feature

extern crate self as tabula_core;

pub mod api;
pub mod bulk;
pub mod config;
pub mod database;
pub mod driver;
pub mod entity;
pub mod error;
pub mod logging;
pub mod reflect;
pub mod row;
pub mod stream;
pub mod transaction;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::TabulaConfig;
pub use database::Database;
pub use error::{StatementContext, TabulaError, TabulaResult};
pub use row::Row;
pub use transaction::Transaction;
pub use value::{FromValue, IntoValue, Json, SqlEnum, TryIntoValue, Value, ValueType};

// Re-export derive macros
pub use tabula_derive::{Entity, Record, SqlEnum};
