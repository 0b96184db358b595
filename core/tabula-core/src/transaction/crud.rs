//! Typed entity operations and bulk export on a transaction.

use super::Transaction;
use crate::api::Query;
use crate::bulk::{BulkDecoder, BulkType, BulkValue};
use crate::entity::{Entity, EntityBinding, IdentityKey, IntoIdentity, Ref};
use crate::error::{TabulaError, TabulaResult};
use crate::value::{TryIntoValue, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

impl<'p> Transaction<'p> {
    /// Inserts `entity`, writing back a generated identity.
    ///
    /// An entity whose identity is generated must arrive transient and
    /// leave with an identity; one whose identity is not generated must
    /// already carry it. Both are checked before anything is sent.
    pub fn insert<E: Entity>(&self, entity: &mut E) -> TabulaResult<()> {
        let binding = EntityBinding::<E>::of()?;
        let (sql, params, keys) = binding.insert_sql(entity)?;
        self.ensure_writable(&sql)?;

        let transient = binding.is_transient(entity)?;
        if binding.is_generated() && !transient {
            return Err(TabulaError::database(
                format!(
                    "{}: identity is generated but the entity already has one",
                    binding.table()
                ),
                self.context(&sql, &binding.identity_values(entity)?),
            ));
        }
        if !binding.is_generated() && transient {
            return Err(TabulaError::database(
                format!(
                    "{}: identity is not generated and the entity has none",
                    binding.table()
                ),
                self.context(&sql, &params),
            ));
        }

        if binding.is_generated() {
            let generated = self.with_connection(&sql, &params, |conn| {
                conn.insert_returning(&sql, &params, &keys)
            })?;
            binding.set_identity(entity, &generated)?;
            if binding.is_transient(entity)? {
                return Err(TabulaError::database(
                    format!("{}: insert returned no generated identity", binding.table()),
                    self.context(&sql, &params),
                ));
            }
        } else {
            self.with_connection(&sql, &params, |conn| conn.execute(&sql, &params))?;
        }

        if let Some(key) = binding.identity(entity)? {
            self.evict::<E>(&key);
        }
        binding.run_post_store(entity)
    }

    /// Updates every non-identity column by identity; returns affected rows.
    pub fn update<E: Entity>(&self, entity: &mut E) -> TabulaResult<u64> {
        let binding = EntityBinding::<E>::of()?;
        let (sql, params) = binding.update_sql(entity)?;
        self.ensure_writable(&sql)?;
        let key = self.require_identity(&binding, entity, &sql)?;

        let affected = self.with_connection(&sql, &params, |conn| conn.execute(&sql, &params))?;
        self.evict::<E>(&key);
        binding.run_post_store(entity)?;
        Ok(affected)
    }

    /// Deletes by identity; returns affected rows.
    pub fn delete<E: Entity>(&self, entity: &E) -> TabulaResult<u64> {
        let binding = EntityBinding::<E>::of()?;
        let (sql, params) = binding.delete_sql(entity)?;
        self.ensure_writable(&sql)?;
        let key = self.require_identity(&binding, entity, &sql)?;

        let affected = self.with_connection(&sql, &params, |conn| conn.execute(&sql, &params))?;
        self.evict::<E>(&key);
        Ok(affected)
    }

    /// Loads one entity by identity. Composite identities are passed as
    /// tuples in identity-column order.
    pub fn find<E: Entity>(&self, id: impl IntoIdentity) -> TabulaResult<Option<E>> {
        let binding = EntityBinding::<E>::of()?;
        let values = id.into_identity();
        let sql = binding.find_sql();
        if values.len() != binding.identity_columns().len() {
            return Err(TabulaError::Mapping(format!(
                "{}: {} identity values for identity ({})",
                binding.table(),
                values.len(),
                binding.identity_columns().join(", ")
            )));
        }
        if values.iter().any(Value::is_null) {
            return Ok(None);
        }

        let mut found = self.query(sql).bind_all(values).fetch_entities::<E>()?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Like [`find`](Self::find), but shares one instance per identity for
    /// the rest of the transaction chain.
    pub fn find_shared<E: Entity>(&self, id: impl IntoIdentity) -> TabulaResult<Option<Arc<E>>> {
        let values = id.into_identity();
        let Some(key) = IdentityKey::from_values(&values) else {
            return Ok(None);
        };
        if let Some(hit) = self.cached_loaded::<E>(&key) {
            return Ok(Some(hit));
        }

        let Some(entity) = self.find::<E>(values)? else {
            return Ok(None);
        };
        let shared = Arc::new(entity);
        self.cache_entity(key, Arc::clone(&shared), true);
        Ok(Some(shared))
    }

    /// Loads the full row behind a relation reference.
    pub fn resolve<T: Entity>(&self, reference: &Ref<T>) -> TabulaResult<Arc<T>> {
        self.find_shared::<T>(reference.id().clone())?.ok_or_else(|| {
            self.invariant(&format!(
                "referenced {} {} does not exist",
                std::any::type_name::<T>(),
                reference.id().render()
            ))
        })
    }

    /// `SELECT <entity columns> FROM <table> <suffix>`.
    pub fn select<E: Entity>(&self, suffix: impl Into<String>) -> Select<'_, E> {
        Select {
            query: self.query(suffix),
            _marker: PhantomData,
        }
    }

    /// Runs `query` as a binary `COPY` export and decodes every row with
    /// `mapper`.
    pub fn copy_binary<R, F>(&self, query: &str, types: &[BulkType], mapper: F) -> TabulaResult<Vec<R>>
    where
        F: FnMut(&[BulkValue]) -> TabulaResult<R>,
    {
        self.ensure_open()?;
        let decoder = BulkDecoder::new(types.to_vec());
        let sql = BulkDecoder::wrap_query(query);
        debug!(tx = %self.display_id(), sql = %sql, columns = types.len(), "bulk export");

        self.connection_scope(&sql, |conn| {
            let mut source = conn
                .copy_out(&sql)
                .map_err(|e| TabulaError::from_driver(e, self.context(&sql, &[])))?;
            let chunks = std::iter::from_fn(|| match source.next_chunk() {
                Ok(Some(chunk)) => Some(Ok(chunk)),
                Ok(None) => None,
                Err(e) => Some(Err(TabulaError::from_driver(e, self.context(&sql, &[])))),
            });
            decoder
                .decode(chunks, mapper)
                .map_err(|e| e.with_context(self.context(&sql, &[])))
        })
    }

    fn require_identity<E: Entity>(
        &self,
        binding: &EntityBinding<E>,
        entity: &E,
        sql: &str,
    ) -> TabulaResult<IdentityKey> {
        binding.identity(entity)?.ok_or_else(|| {
            TabulaError::database(
                format!("{}: entity is transient", binding.table()),
                self.context(sql, &[]),
            )
        })
    }
}

/// Entity query built from a `WHERE`/`ORDER BY` suffix.
pub struct Select<'t, E> {
    query: Query<'t>,
    _marker: PhantomData<fn() -> E>,
}

impl<'t, E: Entity> Select<'t, E> {
    pub fn bind<V: TryIntoValue>(mut self, value: V) -> Self {
        self.query = self.query.bind(value);
        self
    }

    pub fn param<V: TryIntoValue>(mut self, name: &str, value: V) -> Self {
        self.query = self.query.param(name, value);
        self
    }

    pub fn fetch(self) -> TabulaResult<Vec<E>> {
        let binding = EntityBinding::<E>::of()?;
        self.query
            .prefixed(&binding.select_sql())
            .fetch_entities::<E>()
    }

    pub fn fetch_optional(self) -> TabulaResult<Option<E>> {
        Ok(self.fetch()?.into_iter().next())
    }
}
