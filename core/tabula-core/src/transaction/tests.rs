use super::*;
use crate::bulk::{BulkType, BulkValue};
use crate::database::Database;
use crate::driver::{ColumnMeta, DriverError, ResultSet};
use crate::entity::{ColumnBinding, Entity, EntityDescriptor, Ref};
use crate::testing::{CallKind, MockProvider, copy};
use crate::value::{FromValue, IntoValue};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

static STORED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default)]
struct Customer {
    id: Option<i64>,
    name: String,
}

impl Entity for Customer {
    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::new()
            .table("customers")
            .column(
                ColumnBinding::new(
                    "id",
                    |c: &Customer| c.id.into_value(),
                    |c: &mut Customer, v: &Value| {
                        c.id = FromValue::from_value(v)?;
                        Ok(())
                    },
                )
                .generated(),
            )
            .column(ColumnBinding::new(
                "name",
                |c: &Customer| c.name.clone().into_value(),
                |c: &mut Customer, v: &Value| {
                    c.name = FromValue::from_value(v)?;
                    Ok(())
                },
            ))
            .post_store(|_| {
                STORED.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
    }
}

#[derive(Debug, Default)]
struct Order {
    id: i64,
    customer: Option<Ref<Customer>>,
    total: i64,
}

fn customer_of(order: &Order) -> Option<&Ref<Customer>> {
    order.customer.as_ref()
}

fn set_customer(order: &mut Order, customer: Option<Ref<Customer>>) {
    order.customer = customer;
}

impl Entity for Order {
    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::new()
            .table("orders")
            .column(
                ColumnBinding::new(
                    "id",
                    |o: &Order| o.id.into_value(),
                    |o: &mut Order, v: &Value| {
                        o.id = FromValue::from_value(v)?;
                        Ok(())
                    },
                )
                .identity(),
            )
            .column(ColumnBinding::<Order>::relation::<Customer>(
                "customer_id",
                "customer_",
                customer_of,
                set_customer,
            ))
            .column(ColumnBinding::new(
                "total",
                |o: &Order| o.total.into_value(),
                |o: &mut Order, v: &Value| {
                    o.total = FromValue::from_value(v)?;
                    Ok(())
                },
            ))
    }
}

#[derive(Debug, Default)]
struct Tag {
    code: Option<String>,
    label: String,
}

impl Entity for Tag {
    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::new()
            .table("tags")
            .column(
                ColumnBinding::new(
                    "code",
                    |t: &Tag| t.code.clone().into_value(),
                    |t: &mut Tag, v: &Value| {
                        t.code = FromValue::from_value(v)?;
                        Ok(())
                    },
                )
                .identity(),
            )
            .column(ColumnBinding::new(
                "label",
                |t: &Tag| t.label.clone().into_value(),
                |t: &mut Tag, v: &Value| {
                    t.label = FromValue::from_value(v)?;
                    Ok(())
                },
            ))
    }
}

fn setup() -> (MockProvider, Database) {
    let provider = MockProvider::new();
    let db = Database::new(provider.clone());
    (provider, db)
}

fn customers(rows: &[(i64, &str)]) -> ResultSet {
    rows.iter().fold(
        ResultSet::new(vec![
            ColumnMeta::qualified("customers", "id"),
            ColumnMeta::qualified("customers", "name"),
        ]),
        |rs, (id, name)| rs.with_row(vec![Value::Int64(*id), Value::Text((*name).into())]),
    )
}

fn orders(rows: &[(i64, Option<i64>, i64, &str)]) -> ResultSet {
    rows.iter().fold(
        ResultSet::new(vec![
            ColumnMeta::qualified("orders", "id"),
            ColumnMeta::qualified("orders", "customer_id"),
            ColumnMeta::qualified("orders", "total"),
            ColumnMeta::new("customer_name"),
        ]),
        |rs, (id, customer, total, name)| {
            rs.with_row(vec![
                Value::Int64(*id),
                customer.into_value(),
                Value::Int64(*total),
                Value::Text((*name).into()),
            ])
        },
    )
}

#[test]
fn nested_rollback_reverts_only_the_savepoint() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    let child = tx.begin_nested().unwrap();
    let name = child.savepoint().unwrap().to_string();
    child.execute("DELETE FROM carts").run().unwrap();
    child.rollback().unwrap();
    drop(child);
    tx.commit().unwrap();

    assert_eq!(
        provider.log(),
        vec![
            "BEGIN".to_string(),
            format!("SAVEPOINT {name}"),
            "DELETE FROM carts".to_string(),
            format!("ROLLBACK TO SAVEPOINT {name}"),
            format!("RELEASE SAVEPOINT {name}"),
            "COMMIT".to_string(),
        ]
    );
    assert_eq!(provider.open_connections(), 0);
}

#[test]
fn nested_identity_is_displayed_with_parent() {
    let (_, db) = setup();
    let tx = db.begin(false).unwrap();
    let child = tx.begin_nested().unwrap();

    assert!(tx.is_root());
    assert!(tx.savepoint().is_none());
    assert!(!child.is_root());
    assert!(child.savepoint().unwrap().starts_with("tabula_sp_"));
    assert_eq!(child.display_id(), format!("tx#{}({})", child.id(), tx.display_id()));
    assert!(child.id() > tx.id());
    assert_eq!(child.parent().unwrap().id(), tx.id());
}

fn mark(tx: &Transaction<'_>, depth: usize) {
    tx.execute(format!("INSERT INTO effects VALUES ({depth})"))
        .run()
        .unwrap();
}

fn run_chain(tx: &Transaction<'_>, outcomes: &[bool], depth: usize) {
    if let Some((commit, rest)) = outcomes.split_first() {
        let child = tx.begin_nested().unwrap();
        mark(&child, depth);
        run_chain(&child, rest, depth + 1);
        if *commit {
            child.commit().unwrap();
        } else {
            child.rollback().unwrap();
        }
    }
}

/// Replays a call log against savepoint semantics and returns the effect
/// markers that end up committed.
fn committed_effects(log: &[String]) -> Result<Vec<usize>, String> {
    let mut pending: Vec<usize> = Vec::new();
    let mut marks: Vec<(String, usize)> = Vec::new();
    let mut committed = Vec::new();
    let find = |marks: &[(String, usize)], name: &str| {
        marks
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| format!("unknown savepoint {name}"))
    };

    for line in log {
        if line == "BEGIN" {
            pending.clear();
            marks.clear();
        } else if line == "COMMIT" {
            committed.append(&mut pending);
        } else if line == "ROLLBACK" {
            pending.clear();
        } else if let Some(name) = line.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let at = find(&marks, name)?;
            pending.truncate(marks[at].1);
            marks.truncate(at + 1);
        } else if let Some(name) = line.strip_prefix("RELEASE SAVEPOINT ") {
            let at = find(&marks, name)?;
            marks.truncate(at);
        } else if let Some(name) = line.strip_prefix("SAVEPOINT ") {
            marks.push((name.to_string(), pending.len()));
        } else if let Some(depth) = line
            .strip_prefix("INSERT INTO effects VALUES (")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            pending.push(depth.parse().map_err(|_| format!("bad marker {line}"))?);
        } else {
            return Err(format!("unexpected call {line}"));
        }
    }
    Ok(committed)
}

proptest! {
    #[test]
    fn prop_lifo_chain_ends_root_once(
        outcomes in prop::collection::vec(any::<bool>(), 0..6),
        root_commits in any::<bool>(),
    ) {
        let (provider, db) = setup();
        let tx = db.begin(false).unwrap();
        mark(&tx, 0);
        run_chain(&tx, &outcomes, 1);
        prop_assert_eq!(tx.open_children(), 0);
        if root_commits {
            tx.commit().unwrap();
        } else {
            tx.rollback().unwrap();
        }

        let log = provider.log();
        let rolled_back = outcomes.iter().filter(|c| !**c).count();
        prop_assert_eq!(provider.count(CallKind::Savepoint), outcomes.len());
        prop_assert_eq!(provider.count(CallKind::ReleaseSavepoint), outcomes.len());
        prop_assert_eq!(provider.count(CallKind::RollbackToSavepoint), rolled_back);
        prop_assert_eq!(provider.count(CallKind::Commit), usize::from(root_commits));
        prop_assert_eq!(provider.count(CallKind::Rollback), usize::from(!root_commits));
        let expected_end = if root_commits { "COMMIT" } else { "ROLLBACK" };
        prop_assert_eq!(log.last().map(String::as_str), Some(expected_end));

        // A child's work survives only if it and every enclosing level commit.
        let expected: Vec<usize> = if root_commits {
            std::iter::once(0)
                .chain((1..=outcomes.len()).take_while(|depth| outcomes[depth - 1]))
                .collect()
        } else {
            Vec::new()
        };
        prop_assert_eq!(committed_effects(&log), Ok(expected));
    }
}

#[test]
fn open_child_blocks_commit_and_rollback() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    let child = tx.begin_nested().unwrap();

    let err = tx.commit().unwrap_err();
    assert!(err.to_string().contains("open nested"));
    assert!(tx.rollback().is_err());
    assert!(!tx.is_finished());
    assert_eq!(tx.open_children(), 1);
    assert_eq!(provider.count(CallKind::Commit), 0);

    child.commit().unwrap();
    assert_eq!(tx.open_children(), 0);
    tx.commit().unwrap();
}

#[test]
fn read_only_writes_fail_before_any_statement() {
    let (provider, db) = setup();
    let tx = db.begin(true).unwrap();

    let err = tx.execute("UPDATE t SET x = 1").run().unwrap_err();
    assert!(err.to_string().contains("read-only"));
    let mut customer = Customer {
        id: None,
        name: "ada".into(),
    };
    assert!(tx.insert(&mut customer).is_err());
    customer.id = Some(1);
    assert!(tx.update(&mut customer).is_err());
    assert!(tx.delete(&customer).is_err());

    let child = tx.begin_nested().unwrap();
    assert!(child.is_read_only());
    assert!(child.execute("DELETE FROM t").run().is_err());

    assert_eq!(provider.count(CallKind::Execute), 0);
    assert_eq!(provider.count(CallKind::InsertReturning), 0);
}

#[test]
fn implicit_end_depends_on_read_only_flag() {
    let (provider, db) = setup();
    drop(db.begin(false).unwrap());
    drop(db.begin(true).unwrap());
    assert_eq!(
        provider.log(),
        vec!["BEGIN", "ROLLBACK", "BEGIN READ ONLY", "COMMIT"]
    );

    provider.clear_calls();
    let tx = db.begin(false).unwrap();
    let child = tx.begin_nested().unwrap();
    drop(child);
    assert_eq!(tx.open_children(), 0);
    assert_eq!(provider.count(CallKind::RollbackToSavepoint), 1);
    drop(tx);
    assert_eq!(provider.open_connections(), 0);
}

#[test]
fn second_close_is_a_no_op() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    tx.close().unwrap();
    tx.close().unwrap();
    drop(tx);
    assert_eq!(provider.count(CallKind::Rollback), 1);
    assert_eq!(provider.count(CallKind::Close), 1);
}

#[test]
fn finished_transaction_rejects_work() {
    let (_, db) = setup();
    let tx = db.begin(false).unwrap();
    tx.commit().unwrap();

    let err = tx.commit().unwrap_err();
    assert!(err.to_string().contains("already finished"));
    assert!(tx.query("SELECT 1").fetch_rows().is_err());
    assert!(tx.begin_nested().is_err());
    assert!(err.to_string().contains(tx.display_id()));
}

#[test]
fn failed_savepoint_leaves_parent_usable() {
    let (provider, db) = setup();
    provider.fail(CallKind::Savepoint, DriverError::new("too deep"));
    let tx = db.begin(false).unwrap();

    assert!(tx.begin_nested().is_err());
    assert_eq!(tx.open_children(), 0);
    tx.commit().unwrap();
}

#[test]
fn commit_failure_still_releases_connection() {
    let (provider, db) = setup();
    provider.fail(CallKind::Commit, DriverError::new("serialization failure").with_sqlstate("40001"));
    provider.fail(CallKind::Close, DriverError::new("socket closed"));
    let tx = db.begin(false).unwrap();

    let err = tx.commit().unwrap_err();
    assert!(err.primary().to_string().contains("serialization failure"));
    assert_eq!(err.suppressed().len(), 1);
    assert!(tx.is_finished());
    assert_eq!(provider.open_connections(), 0);
}

#[test]
fn constraint_violations_carry_statement_context() {
    let (provider, db) = setup();
    provider.fail(
        CallKind::Execute,
        DriverError::new("duplicate key").with_sqlstate("23505"),
    );
    let tx = db.begin(false).unwrap();

    let err = tx
        .execute("INSERT INTO tags (name) VALUES (:name)")
        .param("name", "rust")
        .run()
        .unwrap_err();
    assert!(err.is_constraint_violation());
    let message = err.to_string();
    assert!(message.contains(tx.display_id()));
    assert!(message.contains("INSERT INTO tags (name) VALUES (?)"));
    assert!(message.contains("'rust'"));
}

#[test]
fn insert_writes_back_generated_identity() {
    let (provider, db) = setup();
    provider.push_generated(vec![Value::Int64(42)]);
    let tx = db.begin(false).unwrap();
    let before = STORED.load(Ordering::SeqCst);

    let mut customer = Customer {
        id: None,
        name: "grace".into(),
    };
    tx.insert(&mut customer).unwrap();

    assert_eq!(customer.id, Some(42));
    assert!(STORED.load(Ordering::SeqCst) > before);
    assert_eq!(
        provider.calls()[2],
        crate::testing::Call::InsertReturning {
            sql: "INSERT INTO customers (name) VALUES (?)".into(),
            params: vec![Value::Text("grace".into())],
            keys: vec!["id".into()],
        }
    );
}

#[test]
fn insert_with_identity_already_set_fails_before_any_statement() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    let mut customer = Customer {
        id: Some(7),
        name: "linus".into(),
    };

    let err = tx.insert(&mut customer).unwrap_err();
    assert!(err.to_string().contains("already has one"));
    assert_eq!(provider.count(CallKind::InsertReturning), 0);
    assert_eq!(provider.count(CallKind::Execute), 0);
}

#[test]
fn insert_without_generated_identity_requires_one() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    let mut order = Order {
        id: 3,
        customer: None,
        total: 10,
    };
    tx.insert(&mut order).unwrap();
    assert_eq!(
        provider.log()[1],
        "INSERT INTO orders (id, customer_id, total) VALUES (?, ?, ?)"
    );
}

#[test]
fn insert_without_identity_value_fails_before_any_statement() {
    let (provider, db) = setup();
    let tx = db.begin(false).unwrap();
    let mut tag = Tag {
        code: None,
        label: "urgent".into(),
    };

    let err = tx.insert(&mut tag).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("identity is not generated and the entity has none"));
    assert!(message.contains(tx.display_id()));
    assert!(message.contains("INSERT INTO tags (code, label) VALUES (?, ?)"));
    assert_eq!(provider.count(CallKind::Execute), 0);
    assert_eq!(provider.count(CallKind::InsertReturning), 0);

    tag.code = Some("urg".into());
    tx.insert(&mut tag).unwrap();
    assert_eq!(provider.count(CallKind::Execute), 1);
}

#[test]
fn update_and_delete_require_identity() {
    let (provider, db) = setup();
    provider.push_affected(1).push_affected(0);
    let tx = db.begin(false).unwrap();
    let mut customer = Customer {
        id: None,
        name: "x".into(),
    };
    assert!(tx.update(&mut customer).is_err());

    customer.id = Some(5);
    assert_eq!(tx.update(&mut customer).unwrap(), 1);
    assert_eq!(tx.delete(&customer).unwrap(), 0);
    assert_eq!(
        provider.log()[1..],
        [
            "UPDATE customers SET name = ? WHERE id = ?",
            "DELETE FROM customers WHERE id = ?",
        ]
    );
}

#[test]
fn find_by_identity() {
    let (provider, db) = setup();
    provider.push_result(customers(&[(5, "ada")]));
    let tx = db.begin(true).unwrap();

    let customer = tx.find::<Customer>(5i64).unwrap().unwrap();
    assert_eq!(customer.name, "ada");
    assert!(tx.find::<Customer>(9i64).unwrap().is_none());
    assert!(tx.find::<Customer>(Value::Null).unwrap().is_none());
    assert!(tx.find::<Customer>((1i64, 2i64)).unwrap_err().is_mapping());

    assert_eq!(provider.count(CallKind::Query), 2);
    assert_eq!(
        provider.log()[1],
        "SELECT id, name FROM customers WHERE id = ?"
    );
}

#[test]
fn rows_sharing_a_foreign_key_share_one_instance() {
    let (provider, db) = setup();
    provider.push_result(orders(&[(1, Some(5), 10, "ada"), (2, Some(5), 20, "ada")]));
    provider.push_result(orders(&[(3, Some(5), 30, "ada"), (4, None, 40, "")]));
    let tx = db.begin(true).unwrap();

    let first = tx.select::<Order>("WHERE total > ?").bind(0i64).fetch().unwrap();
    let second = tx.find::<Order>(3i64).unwrap().unwrap();

    let a = first[0].customer.as_ref().unwrap();
    let b = first[1].customer.as_ref().unwrap();
    let c = second.customer.as_ref().unwrap();
    assert!(Ref::ptr_eq(a, b));
    assert!(Ref::ptr_eq(a, c));
    let customer: &Customer = a;
    assert_eq!(customer.id, Some(5));
    assert_eq!(customer.name, "ada");
    assert_eq!(
        provider.log()[1],
        "SELECT id, customer_id, total FROM orders WHERE total > ?"
    );
}

#[test]
fn null_foreign_key_is_no_reference() {
    let (provider, db) = setup();
    provider.push_result(orders(&[(4, None, 40, "")]));
    let tx = db.begin(true).unwrap();
    let order = tx.find::<Order>(4i64).unwrap().unwrap();
    assert!(order.customer.is_none());
}

#[test]
fn resolve_loads_the_full_row_once() {
    let (provider, db) = setup();
    provider.push_result(orders(&[(1, Some(5), 10, "")]));
    provider.push_result(customers(&[(5, "ada")]));
    let tx = db.begin(true).unwrap();

    let order = tx.find::<Order>(1i64).unwrap().unwrap();
    let stub = order.customer.as_ref().unwrap();
    assert_eq!(stub.name, "");

    let full = tx.resolve(stub).unwrap();
    assert_eq!(full.name, "ada");
    let again = tx.find_shared::<Customer>(5i64).unwrap().unwrap();
    assert!(Arc::ptr_eq(&full, &again));
    assert_eq!(provider.count(CallKind::Query), 2);
}

#[test]
fn identity_cache_is_shared_by_the_chain_and_cleared_at_the_end() {
    let (provider, db) = setup();
    provider.push_result(customers(&[(5, "ada")]));
    let tx = db.begin(true).unwrap();
    let outer = tx.find_shared::<Customer>(5i64).unwrap().unwrap();
    {
        let child = tx.begin_nested().unwrap();
        let inner = child.find_shared::<Customer>(5i64).unwrap().unwrap();
        assert!(Arc::ptr_eq(&outer, &inner));
        child.commit().unwrap();
    }
    assert_eq!(tx.cache_stats().size, 1);
    tx.commit().unwrap();
    assert_eq!(tx.cache_stats().size, 0);
}

#[test]
fn savepoint_rollback_discards_cached_entities() {
    let (provider, db) = setup();
    provider.push_result(customers(&[(5, "ada")]));
    provider.push_result(customers(&[(5, "changed")]));
    provider.push_result(customers(&[(5, "ada")]));
    let tx = db.begin(false).unwrap();
    {
        let child = tx.begin_nested().unwrap();
        let mut customer = child.find::<Customer>(5i64).unwrap().unwrap();
        customer.name = "changed".into();
        child.update(&mut customer).unwrap();
        let seen = child.find_shared::<Customer>(5i64).unwrap().unwrap();
        assert_eq!(seen.name, "changed");
        child.rollback().unwrap();
    }

    let after = tx.find_shared::<Customer>(5i64).unwrap().unwrap();
    assert_eq!(after.name, "ada");
    assert_eq!(provider.count(CallKind::Query), 3);
    tx.commit().unwrap();
}

#[test]
fn writes_evict_cached_instances() {
    let (provider, db) = setup();
    provider.push_result(customers(&[(5, "ada")]));
    provider.push_result(customers(&[(5, "ada")]));
    provider.push_result(customers(&[(5, "ada lovelace")]));
    let tx = db.begin(false).unwrap();

    let mut loaded = tx.find::<Customer>(5i64).unwrap().unwrap();
    tx.find_shared::<Customer>(5i64).unwrap();
    loaded.name = "ada lovelace".into();
    tx.update(&mut loaded).unwrap();

    let fresh = tx.find_shared::<Customer>(5i64).unwrap().unwrap();
    assert_eq!(fresh.name, "ada lovelace");
    assert_eq!(provider.count(CallKind::Query), 3);
}

#[test]
fn query_helpers() {
    let (provider, db) = setup();
    let counted = ResultSet::new(vec![ColumnMeta::new("n")]).with_row(vec![Value::Int64(3)]);
    provider.push_result(counted).push_result(ResultSet::new(vec![ColumnMeta::new("n")]));
    let tx = db.begin(true).unwrap();

    let n: i64 = tx
        .query("SELECT count(*) AS n FROM t WHERE kind = :kind")
        .param("kind", "a")
        .fetch_scalar()
        .unwrap();
    assert_eq!(n, 3);
    assert!(tx.query("SELECT n FROM t").fetch_one().is_err());
    assert_eq!(provider.log()[1], "SELECT count(*) AS n FROM t WHERE kind = ?");
}

#[test]
fn copy_binary_decodes_exported_rows() {
    let (provider, db) = setup();
    let (seven, eight) = (7i64.to_be_bytes(), 8i64.to_be_bytes());
    provider.push_copy(vec![
        copy::header(),
        copy::frame(&[Some(&seven[..]), Some(&b"seven"[..])]),
        copy::frame(&[Some(&eight[..]), None]),
        copy::trailer(),
    ]);
    let tx = db.begin(true).unwrap();

    let rows = tx
        .copy_binary("SELECT id, payload FROM blobs", &[BulkType::Int64, BulkType::Bytes], |row| {
            Ok((row[0].as_i64(), row[1].clone()))
        })
        .unwrap();
    assert_eq!(
        rows,
        vec![
            (Some(7), BulkValue::Bytes(b"seven".to_vec())),
            (Some(8), BulkValue::Null),
        ]
    );
    assert_eq!(
        provider.log()[1],
        "COPY (SELECT id, payload FROM blobs) TO STDOUT WITH (FORMAT binary)"
    );
}

#[test]
fn bulk_decode_failures_name_transaction_and_statement() {
    let (provider, db) = setup();
    provider.push_copy(vec![
        copy::header(),
        copy::frame(&[Some(&7i32.to_be_bytes()[..])]),
        copy::trailer(),
    ]);
    let tx = db.begin(true).unwrap();

    let err = tx
        .copy_binary("SELECT id FROM t", &[BulkType::Int64], |row| Ok(row[0].as_i64()))
        .unwrap_err();
    assert!(err.is_decode());
    let message = err.to_string();
    assert!(message.contains(tx.display_id()));
    assert!(message.contains("COPY (SELECT id FROM t)"));
}

#[test]
fn row_mapping_failures_name_transaction_and_statement() {
    let (provider, db) = setup();
    provider.push_result(
        ResultSet::new(vec![ColumnMeta::qualified("customers", "id")])
            .with_row(vec![Value::Int64(5)]),
    );
    let tx = db.begin(true).unwrap();

    let err = tx
        .query("SELECT id FROM customers")
        .fetch_entities::<Customer>()
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("name"));
    assert!(message.contains(tx.display_id()));
    assert!(message.contains("SQL: SELECT id FROM customers"));
}
