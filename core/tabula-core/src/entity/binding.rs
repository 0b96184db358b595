//! Declared entity bindings.
//!
//! An [`EntityDescriptor`] is the static binding table of one entity type,
//! written by hand or generated by `#[derive(Entity)]`. [`EntityBinding::of`]
//! validates it once and caches the result for the life of the process, so
//! misconfiguration fails on first use and never while decoding rows.

use super::identity::IdentityKey;
use super::{Entity, Ref};
use crate::error::{TabulaError, TabulaResult};
use crate::row::Row;
use crate::transaction::Transaction;
use crate::value::Value;
use ahash::AHashSet;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::any::{Any, TypeId};
use std::sync::{Arc, LazyLock};

/// Lifecycle hook run after an entity is loaded or stored.
pub type Hook<E> = fn(&mut E) -> TabulaResult<()>;

type Getter<E> = Box<dyn Fn(&E) -> TabulaResult<Value> + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, &Value) -> TabulaResult<()> + Send + Sync>;
type RelationInjector<E> =
    Box<dyn Fn(&mut E, &Value, &Row, &Transaction<'_>) -> TabulaResult<()> + Send + Sync>;

enum Access<E> {
    Plain {
        get: Getter<E>,
        set: Setter<E>,
    },
    Relation {
        get: Getter<E>,
        inject: RelationInjector<E>,
        target: &'static str,
        target_identity_columns: fn() -> usize,
    },
}

/// One bound column of an entity.
pub struct ColumnBinding<E> {
    name: String,
    identity: bool,
    generated: bool,
    access: Access<E>,
}

impl<E: Entity> ColumnBinding<E> {
    /// A plain column read with `get` and written with `set`.
    pub fn new<G, S>(name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Value + Send + Sync + 'static,
        S: Fn(&mut E, &Value) -> TabulaResult<()> + Send + Sync + 'static,
    {
        Self::try_new(name, move |entity: &E| Ok(get(entity)), set)
    }

    /// Like [`ColumnBinding::new`], for columns whose encoding can fail.
    pub fn try_new<G, S>(name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&E) -> TabulaResult<Value> + Send + Sync + 'static,
        S: Fn(&mut E, &Value) -> TabulaResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            identity: false,
            generated: false,
            access: Access::Plain {
                get: Box::new(get),
                set: Box::new(set),
            },
        }
    }

    /// A single-valued relation stored as a foreign key to `T`.
    ///
    /// When loading, the referenced entity is taken from the transaction's
    /// identity cache, or stubbed from the foreign key and filled from
    /// `<prefix><column>` columns present in the same row.
    pub fn relation<T: Entity>(
        name: impl Into<String>,
        prefix: impl Into<String>,
        get: fn(&E) -> Option<&Ref<T>>,
        set: fn(&mut E, Option<Ref<T>>),
    ) -> Self {
        let prefix = prefix.into();
        Self {
            name: name.into(),
            identity: false,
            generated: false,
            access: Access::Relation {
                get: Box::new(move |entity: &E| {
                    Ok(get(entity).map_or(Value::Null, |target| target.id().clone()))
                }),
                inject: Box::new(move |entity: &mut E, key: &Value, row: &Row, tx: &Transaction<'_>| {
                    set(entity, Ref::<T>::load(key, &prefix, row, tx)?);
                    Ok(())
                }),
                target: std::any::type_name::<T>(),
                target_identity_columns: || T::descriptor().identity_count(),
            },
        }
    }

    /// Marks the column as (part of) the identity.
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Marks the identity column as generated by the database on insert.
    pub fn generated(mut self) -> Self {
        self.identity = true;
        self.generated = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.access, Access::Relation { .. })
    }

    fn get(&self, entity: &E) -> TabulaResult<Value> {
        match &self.access {
            Access::Plain { get, .. } | Access::Relation { get, .. } => get(entity),
        }
    }
}

/// Static binding table of an entity type.
pub struct EntityDescriptor<E> {
    table: Option<String>,
    columns: Vec<ColumnBinding<E>>,
    post_load: Option<Hook<E>>,
    post_store: Option<Hook<E>>,
}

impl<E: Entity> Default for EntityDescriptor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityDescriptor<E> {
    pub fn new() -> Self {
        Self {
            table: None,
            columns: Vec::new(),
            post_load: None,
            post_store: None,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn column(mut self, column: ColumnBinding<E>) -> Self {
        self.columns.push(column);
        self
    }

    pub fn post_load(mut self, hook: Hook<E>) -> Self {
        self.post_load = Some(hook);
        self
    }

    pub fn post_store(mut self, hook: Hook<E>) -> Self {
        self.post_store = Some(hook);
        self
    }

    pub fn identity_count(&self) -> usize {
        self.columns.iter().filter(|c| c.identity).count()
    }
}

static BINDINGS: LazyLock<DashMap<TypeId, Arc<dyn Any + Send + Sync>>> =
    LazyLock::new(DashMap::new);

/// Validated, immutable binding of one entity type.
pub struct EntityBinding<E> {
    table: String,
    columns: Vec<ColumnBinding<E>>,
    identity: Vec<usize>,
    generated: bool,
    post_load: Option<Hook<E>>,
    post_store: Option<Hook<E>>,
}

impl<E: Entity> EntityBinding<E> {
    /// The process-wide binding of `E`, built and validated on first use.
    pub fn of() -> TabulaResult<Arc<Self>> {
        let key = TypeId::of::<E>();
        if let Some(cached) = BINDINGS.get(&key) {
            return Self::downcast(Arc::clone(cached.value()));
        }

        let built: Arc<dyn Any + Send + Sync> = Arc::new(Self::build(E::descriptor())?);
        // Racing first uses build equal bindings; whichever lands first wins.
        let shared = Arc::clone(BINDINGS.entry(key).or_insert(built).value());
        Self::downcast(shared)
    }

    fn downcast(any: Arc<dyn Any + Send + Sync>) -> TabulaResult<Arc<Self>> {
        any.downcast::<Self>().map_err(|_| {
            TabulaError::Mapping(format!(
                "binding cache holds a foreign type for {}",
                std::any::type_name::<E>()
            ))
        })
    }

    fn build(descriptor: EntityDescriptor<E>) -> TabulaResult<Self> {
        let entity = std::any::type_name::<E>();
        let fail = |reason: String| Err(TabulaError::Mapping(format!("{entity}: {reason}")));

        let Some(table) = descriptor.table.filter(|t| !t.trim().is_empty()) else {
            return fail("no table name declared".to_string());
        };
        if descriptor.columns.is_empty() {
            return fail(format!("table '{table}' declares no columns"));
        }

        let mut seen = AHashSet::with_capacity(descriptor.columns.len());
        for column in &descriptor.columns {
            if column.name.is_empty() {
                return fail("empty column name".to_string());
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return fail(format!("column '{}' bound more than once", column.name));
            }
        }

        let identity: Vec<usize> = descriptor
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.identity)
            .map(|(idx, _)| idx)
            .collect();
        if identity.is_empty() {
            return fail("no identity column declared".to_string());
        }

        let generated = descriptor.columns.iter().any(|c| c.generated);
        if generated && identity.len() > 1 {
            return fail("a generated identity cannot be composite".to_string());
        }

        for column in &descriptor.columns {
            if let Access::Relation {
                target,
                target_identity_columns,
                ..
            } = &column.access
            {
                if column.identity {
                    return fail(format!("relation '{}' cannot be an identity column", column.name));
                }
                let count = target_identity_columns();
                if count != 1 {
                    return fail(format!(
                        "relation '{}' targets {target} with {count} identity columns; exactly one is required",
                        column.name
                    ));
                }
            }
        }

        Ok(Self {
            table,
            columns: descriptor.columns,
            identity,
            generated,
            post_load: descriptor.post_load,
            post_store: descriptor.post_store,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn identity_columns(&self) -> Vec<&str> {
        self.identity
            .iter()
            .map(|idx| self.columns[*idx].name.as_str())
            .collect()
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// Every bound column's current value, in declaration order.
    pub fn values(&self, entity: &E) -> TabulaResult<IndexMap<String, Value>> {
        self.columns
            .iter()
            .map(|c| Ok((c.name.clone(), self.read(c, entity)?)))
            .collect()
    }

    pub fn identity_values(&self, entity: &E) -> TabulaResult<Vec<Value>> {
        self.identity
            .iter()
            .map(|idx| self.read(&self.columns[*idx], entity))
            .collect()
    }

    /// `None` while the entity is transient.
    pub fn identity(&self, entity: &E) -> TabulaResult<Option<IdentityKey>> {
        Ok(IdentityKey::from_values(&self.identity_values(entity)?))
    }

    /// Whether any identity component is still NULL.
    pub fn is_transient(&self, entity: &E) -> TabulaResult<bool> {
        Ok(self.identity_values(entity)?.iter().any(Value::is_null))
    }

    fn read(&self, column: &ColumnBinding<E>, entity: &E) -> TabulaResult<Value> {
        column.get(entity).map_err(|e| self.column_error(&column.name, e))
    }

    /// Populates `entity` from `row`. Columns are looked up as
    /// `table/column` first, then bare.
    pub fn inject(&self, entity: &mut E, row: &Row, tx: &Transaction<'_>) -> TabulaResult<()> {
        for column in &self.columns {
            let value = self.lookup(row, &column.name)?;
            match &column.access {
                Access::Plain { set, .. } => {
                    set(entity, value).map_err(|e| self.column_error(&column.name, e))?
                }
                Access::Relation { inject, .. } => inject(entity, value, row, tx)
                    .map_err(|e| self.column_error(&column.name, e))?,
            }
        }
        Ok(())
    }

    /// A fresh entity injected from `row`, post-load hook applied.
    pub fn load(&self, row: &Row, tx: &Transaction<'_>) -> TabulaResult<E> {
        let mut entity = E::default();
        self.inject(&mut entity, row, tx)?;
        self.run_post_load(&mut entity)?;
        Ok(entity)
    }

    /// Writes `values` into the identity columns, in identity order.
    pub fn set_identity(&self, entity: &mut E, values: &[Value]) -> TabulaResult<()> {
        if values.len() != self.identity.len() {
            return Err(TabulaError::Mapping(format!(
                "{}: {} identity values for {} identity columns",
                self.table,
                values.len(),
                self.identity.len()
            )));
        }
        for (idx, value) in self.identity.iter().zip(values) {
            let column = &self.columns[*idx];
            if let Access::Plain { set, .. } = &column.access {
                set(entity, value).map_err(|e| self.column_error(&column.name, e))?;
            }
        }
        Ok(())
    }

    /// Fills plain non-identity columns from `<prefix><column>` values that
    /// `row` happens to carry. Absent columns are left at their defaults.
    pub fn populate_prefixed(&self, entity: &mut E, prefix: &str, row: &Row) -> TabulaResult<()> {
        for column in self.columns.iter().filter(|c| !c.identity) {
            let Access::Plain { set, .. } = &column.access else {
                continue;
            };
            if let Some(value) = row.try_value(&format!("{prefix}{}", column.name)) {
                set(entity, value).map_err(|e| self.column_error(&column.name, e))?;
            }
        }
        Ok(())
    }

    pub fn run_post_load(&self, entity: &mut E) -> TabulaResult<()> {
        match self.post_load {
            Some(hook) => hook(entity),
            None => Ok(()),
        }
    }

    pub fn run_post_store(&self, entity: &mut E) -> TabulaResult<()> {
        match self.post_store {
            Some(hook) => hook(entity),
            None => Ok(()),
        }
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT {} FROM {}", self.column_names().join(", "), self.table)
    }

    pub fn find_sql(&self) -> String {
        format!("{} WHERE {}", self.select_sql(), self.identity_predicate())
    }

    /// `INSERT` statement and parameters. A generated identity is left out
    /// and reported back as the key columns to return.
    pub fn insert_sql(&self, entity: &E) -> TabulaResult<(String, Vec<Value>, Vec<&str>)> {
        let mut names = Vec::with_capacity(self.columns.len());
        let mut params = Vec::with_capacity(self.columns.len());
        let mut keys = Vec::new();
        for column in &self.columns {
            if column.generated {
                keys.push(column.name.as_str());
                continue;
            }
            names.push(column.name.as_str());
            params.push(self.read(column, entity)?);
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.table,
            names.join(", ")
        );
        Ok((sql, params, keys))
    }

    pub fn update_sql(&self, entity: &E) -> TabulaResult<(String, Vec<Value>)> {
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in self.columns.iter().filter(|c| !c.identity) {
            assignments.push(format!("{} = ?", column.name));
            params.push(self.read(column, entity)?);
        }
        if assignments.is_empty() {
            return Err(TabulaError::Mapping(format!(
                "{}: no non-identity columns to update",
                self.table
            )));
        }
        params.extend(self.identity_values(entity)?);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table,
            assignments.join(", "),
            self.identity_predicate()
        );
        Ok((sql, params))
    }

    pub fn delete_sql(&self, entity: &E) -> TabulaResult<(String, Vec<Value>)> {
        let sql = format!("DELETE FROM {} WHERE {}", self.table, self.identity_predicate());
        Ok((sql, self.identity_values(entity)?))
    }

    fn identity_predicate(&self) -> String {
        self.identity_columns()
            .iter()
            .map(|name| format!("{name} = ?"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn lookup<'r>(&self, row: &'r Row, column: &str) -> TabulaResult<&'r Value> {
        match row.try_value(&format!("{}/{column}", self.table)) {
            Some(value) => Ok(value),
            None => row.value(column),
        }
    }

    fn column_error(&self, column: &str, err: TabulaError) -> TabulaError {
        match err {
            TabulaError::Column { .. } => err,
            other => TabulaError::Column {
                column: format!("{}.{column}", self.table),
                reason: other.to_string(),
            },
        }
    }
}
