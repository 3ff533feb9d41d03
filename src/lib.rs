// ============================================================================
// RustSpan Library
// ============================================================================

pub mod core;
pub mod rpc;
pub mod session;
pub mod transaction;
pub mod batch;
pub mod result;
pub mod facade;

// Re-export main types for convenience
pub use facade::Database;
pub use core::{Catalog, Code, Column, DataType, DbError, Key, Phase, Result, Row, Status, TableSchema, Value};
pub use result::{QueryResult, ResultSet};

// Re-export session API
pub use session::{
    DatabasePath, Lease, PoolConfig, PoolStats, SessionHandle, SessionPool, SessionRole,
};

// Re-export transaction API
pub use transaction::{
    BeginMode, CommitResult, IsolationLevel, KeyRange, KeySet, LeasedTransaction, Mutation,
    MutationBuffer, Priority, ReadLockMode, RequestOptions, RetrySettings, SessionKind, Snapshot,
    TimestampBound, TransactionContext, TransactionMode, TransactionOptions, TransactionRunner,
};

pub use batch::{BatchTransaction, BatchTransactionId, Partition};
pub use rpc::{CommitResponse, DatabaseRpc, PartitionOptions, ReadSpec, Statement};

// ============================================================================
// Quick start
// ============================================================================
//
// ```no_run
// use std::sync::Arc;
// use rustspan::rpc::memory::MemoryDatabase;
// use rustspan::{Database, PoolConfig, Value};
//
// # async fn demo() -> rustspan::Result<()> {
// let rpc = Arc::new(MemoryDatabase::new("projects/p/instances/i/databases/d".parse()?));
// let db = Database::open(rpc, PoolConfig::new().max_sessions(10)).await?;
//
// let outcome = db
//     .run_transaction(|txn| async move {
//         txn.insert_or_update("Counters", &["Name", "Value"], vec![vec![Value::from("hits"), Value::from(1)]])?;
//         Ok(())
//     })
//     .await?;
// println!("committed at {} after {} attempt(s)", outcome.commit_timestamp, outcome.attempts);
//
// db.close().await;
// # Ok(())
// # }
// ```
