//! Fluent statement builders
//!
//! `Query` and `Execute` are created from a [`crate::Transaction`]; entity
//! selects live next to the transaction's typed operations.

pub mod query;

pub use query::{Execute, ParamError, Params, Query};
