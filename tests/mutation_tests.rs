/// Mutation buffer tests
///
/// Buffered writes are applied atomically and in the order they were appended
/// Run with: cargo test --test mutation_tests

use rustspan::rpc::memory::{MemoryDatabase, Method};
use rustspan::{
    Column, DataType, Database, DbError, KeyRange, KeySet, PoolConfig, TableSchema, Value,
};
use std::sync::Arc;

fn service() -> Arc<MemoryDatabase> {
    let rpc = Arc::new(
        MemoryDatabase::new("projects/test/instances/local/databases/mut".parse().unwrap())
            .with_table(TableSchema::new(
                "Singers",
                vec![
                    Column::new("SingerId", DataType::Integer).not_null(),
                    Column::new("Name", DataType::Text),
                    Column::new("Active", DataType::Boolean),
                ],
                vec!["SingerId"],
            )),
    );
    rpc.seed(
        "Singers",
        (1..=5)
            .map(|i| vec![Value::Integer(i), Value::Text(format!("singer {}", i)), Value::Boolean(true)])
            .collect(),
    )
    .unwrap();
    rpc
}

fn singer(rpc: &MemoryDatabase, id: i64) -> Option<Vec<Value>> {
    rpc.row("Singers", &vec![Value::Integer(id)])
}

#[tokio::test]
async fn test_delete_then_insert_same_key_keeps_new_row() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    db.run_transaction(|txn| async move {
        txn.delete("Singers", KeySet::key(vec![Value::Integer(1)]))?;
        txn.insert(
            "Singers",
            &["SingerId", "Name", "Active"],
            vec![vec![Value::Integer(1), Value::Text("reborn".into()), Value::Boolean(false)]],
        )?;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(
        singer(&rpc, 1),
        Some(vec![Value::Integer(1), Value::Text("reborn".into()), Value::Boolean(false)])
    );
}

#[tokio::test]
async fn test_insert_then_delete_same_key_leaves_nothing() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    let mut buffer = db.mutations();
    buffer
        .insert(
            "Singers",
            &["SingerId", "Name"],
            vec![vec![Value::Integer(42), Value::Text("brief".into())]],
        )
        .unwrap();
    buffer
        .delete("Singers", KeySet::key(vec![Value::Integer(42)]))
        .unwrap();
    db.write(buffer).await.unwrap();

    assert_eq!(singer(&rpc, 42), None);
}

#[tokio::test]
async fn test_update_keeps_unwritten_columns_and_replace_clears_them() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    let mut buffer = db.mutations();
    buffer
        .update("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(2), Value::Text("renamed".into())]])
        .unwrap();
    buffer
        .replace("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(3), Value::Text("replaced".into())]])
        .unwrap();
    db.write(buffer).await.unwrap();

    assert_eq!(
        singer(&rpc, 2),
        Some(vec![Value::Integer(2), Value::Text("renamed".into()), Value::Boolean(true)])
    );
    assert_eq!(
        singer(&rpc, 3),
        Some(vec![Value::Integer(3), Value::Text("replaced".into()), Value::Null])
    );
}

#[tokio::test]
async fn test_range_delete_respects_bounds() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    let mut buffer = db.mutations();
    buffer
        .delete(
            "Singers",
            KeySet::range(KeyRange::closed_open(vec![Value::Integer(2)], vec![Value::Integer(4)])),
        )
        .unwrap();
    db.write(buffer).await.unwrap();

    assert!(singer(&rpc, 1).is_some());
    assert!(singer(&rpc, 2).is_none());
    assert!(singer(&rpc, 3).is_none());
    assert!(singer(&rpc, 4).is_some());
}

#[tokio::test]
async fn test_failed_mutation_applies_none_of_the_batch() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    let mut buffer = db.mutations();
    buffer
        .update("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(4), Value::Text("changed".into())]])
        .unwrap();
    // Row 77 does not exist, so the update fails at commit.
    buffer
        .update("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(77), Value::Text("ghost".into())]])
        .unwrap();
    let err = db.write(buffer).await.unwrap_err();

    assert!(err.status().is_some());
    assert_eq!(
        singer(&rpc, 4),
        Some(vec![Value::Integer(4), Value::Text("singer 4".into()), Value::Boolean(true)])
    );
}

#[tokio::test]
async fn test_pending_mutations_keep_append_order() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap();

    let outcome = db
        .run_transaction(|txn| async move {
            txn.insert_or_update("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(9), Value::Text("a".into())]])?;
            txn.delete("Singers", KeySet::key(vec![Value::Integer(5)]))?;
            txn.update("Singers", &["SingerId", "Name"], vec![vec![Value::Integer(9), Value::Text("b".into())]])?;
            Ok(txn
                .pending_mutations()
                .iter()
                .map(|m| m.kind())
                .collect::<Vec<_>>())
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, vec!["insert_or_update", "delete", "update"]);
    assert_eq!(singer(&rpc, 9).map(|r| r[1].clone()), Some(Value::Text("b".into())));
    assert!(singer(&rpc, 5).is_none());
}

#[tokio::test]
async fn test_catalog_checks_run_before_any_rpc() {
    let rpc = service();
    let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
        .await
        .unwrap()
        .with_catalog(rpc.catalog());

    let mut buffer = db.mutations();
    let err = buffer
        .insert("Singers", &["SingerId", "Name"], vec![vec![Value::Text("one".into()), Value::Text("x".into())]])
        .unwrap_err();
    assert!(matches!(err, DbError::TypeMismatch(_)));

    let err = buffer
        .insert("Albums", &["AlbumId"], vec![vec![Value::Integer(1)]])
        .unwrap_err();
    assert!(matches!(err, DbError::TableNotFound(_)));

    let err = buffer
        .delete("Singers", KeySet::key(vec![Value::Integer(1), Value::Integer(2)]))
        .unwrap_err();
    assert!(matches!(err, DbError::ConstraintViolation(_)));

    assert!(buffer.is_empty());
    assert_eq!(rpc.call_count(Method::Commit), 0);
}
