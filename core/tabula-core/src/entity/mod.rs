//! Mutable entities.
//!
//! An entity type declares its table, columns and identity through an
//! [`EntityDescriptor`], usually generated by `#[derive(Entity)]`:
//!
//! ```rust,ignore
//! #[derive(Debug, Default, Entity)]
//! #[tabula(table = "orders")]
//! struct Order {
//!     #[tabula(id, generated)]
//!     id: Option<i64>,
//!     total: i64,
//!     #[tabula(relation, column = "customer_id", prefix = "customer_")]
//!     customer: Option<Ref<Customer>>,
//! }
//! ```
//!
//! Relations are single-hop: a [`Ref`] points at a shared instance that is
//! either already cached by the transaction or a stub carrying the foreign
//! key plus whatever prefixed columns the row supplied.
//! [`Transaction::resolve`] loads the full row on demand.

mod binding;
mod identity;

pub use binding::{ColumnBinding, EntityBinding, EntityDescriptor, Hook};
pub use identity::{IdentityKey, IntoIdentity, KeyPart};

use crate::error::{TabulaError, TabulaResult};
use crate::row::Row;
use crate::transaction::Transaction;
use crate::value::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A mutable row type with a declared binding.
///
/// `Default` is required so relation stubs and query results can be built
/// before their columns are injected.
pub trait Entity: Default + Send + Sync + 'static {
    fn descriptor() -> EntityDescriptor<Self>;
}

/// Shared single-hop reference to another entity.
pub struct Ref<T> {
    id: Value,
    target: Arc<T>,
}

impl<T> Ref<T> {
    /// The referenced identity (the foreign-key value).
    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.target)
    }

    /// Whether both references point at the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.target, &b.target)
    }
}

impl<T: Entity> Ref<T> {
    /// References an entity that already has its identity.
    pub fn new(entity: T) -> TabulaResult<Self> {
        Self::from_shared(Arc::new(entity))
    }

    pub fn from_shared(target: Arc<T>) -> TabulaResult<Self> {
        let binding = EntityBinding::<T>::of()?;
        let mut identity = binding.identity_values(&target)?;
        match identity.pop() {
            Some(id) if identity.is_empty() && !id.is_null() => Ok(Self { id, target }),
            _ => Err(TabulaError::Mapping(format!(
                "{}: only a non-transient entity with a single identity column can be referenced",
                binding.table()
            ))),
        }
    }

    pub(crate) fn load(
        key: &Value,
        prefix: &str,
        row: &Row,
        tx: &Transaction<'_>,
    ) -> TabulaResult<Option<Self>> {
        let Some(identity) = IdentityKey::from_values(std::slice::from_ref(key)) else {
            return Ok(None);
        };
        if let Some(cached) = tx.cached::<T>(&identity) {
            return Ok(Some(Self {
                id: key.clone(),
                target: cached,
            }));
        }

        let binding = EntityBinding::<T>::of()?;
        let mut stub = T::default();
        binding.set_identity(&mut stub, std::slice::from_ref(key))?;
        binding.populate_prefixed(&mut stub, prefix, row)?;

        let target = Arc::new(stub);
        tx.cache_entity(identity, Arc::clone(&target), false);
        Ok(Some(Self {
            id: key.clone(),
            target,
        }))
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            target: Arc::clone(&self.target),
        }
    }
}

impl<T> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.target
    }
}

impl<T: fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}
