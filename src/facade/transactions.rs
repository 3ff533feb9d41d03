use super::Database;
use crate::core::{Phase, Result};
use crate::rpc::{
    self, BeginTransactionRequest, CommitRequest, CommitResponse, CommitTarget, ExecuteSqlRequest,
    Statement, TransactionSelector,
};
use crate::session::Lease;
use crate::transaction::context::settle;
use crate::transaction::{
    CommitResult, LeasedTransaction, MutationBuffer, SessionKind, TransactionContext,
    TransactionMode, TransactionOptions, TransactionRunner,
};
use std::time::Duration;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

impl Database {
    /// A runner carrying this database's defaults.
    pub fn runner(&self) -> TransactionRunner {
        self.runner_with(self.transaction_options.clone())
    }

    fn runner_with(&self, options: TransactionOptions) -> TransactionRunner {
        let runner = TransactionRunner::new(Arc::clone(&self.pool))
            .options(options)
            .request_options(self.request_options.clone());
        match &self.catalog {
            Some(catalog) => runner.catalog(Arc::clone(catalog)),
            None => runner,
        }
    }

    /// Runs `work` in a read-write transaction, retrying it on ABORTED.
    ///
    /// ```no_run
    /// # use rustspan::{Database, Value};
    /// # tokio_test::block_on(async {
    /// # let db: Database = todo!();
    /// db.run_transaction(|txn| async move {
    ///     let row = txn.read_row("Accounts", &["Id", "Balance"], vec![Value::Integer(1)]).await?;
    ///     let balance = row.and_then(|r| r[1].as_i64()).unwrap_or(0);
    ///     txn.update("Accounts", &["Id", "Balance"], vec![vec![Value::Integer(1), Value::Integer(balance - 10)]])?;
    ///     Ok(())
    /// })
    /// .await
    /// .unwrap();
    /// # });
    /// ```
    pub async fn run_transaction<T, F, Fut>(&self, work: F) -> Result<CommitResult<T>>
    where
        F: FnMut(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.runner().run(work).await
    }

    pub async fn run_transaction_with<T, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<CommitResult<T>>
    where
        F: FnMut(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.runner_with(options).run(work).await
    }

    /// Leases a session and begins a transaction the caller drives by hand.
    ///
    /// There is no automatic retry: an ABORTED commit is returned to the
    /// caller, who must start over with a new transaction.
    pub async fn get_transaction(&self) -> Result<LeasedTransaction> {
        let options = &self.transaction_options;
        options.validate()?;
        let lease = self.pool.acquire(options.session_kind).await?;
        LeasedTransaction::begin(lease, options, &self.request_options, self.catalog.clone()).await
    }

    /// Commits `mutations` in a single-use transaction, without reading first.
    ///
    /// Not retried on any error: replaying a blind write can apply it twice.
    #[instrument(skip(self, mutations), fields(mutations = mutations.len()))]
    pub async fn write(&self, mutations: MutationBuffer) -> Result<CommitResponse> {
        let options = &self.transaction_options;
        options.validate()?;
        let lease = self.pool.acquire(options.session_kind).await?;

        let request = CommitRequest {
            transaction: CommitTarget::SingleUse(options.mode()),
            mutations: mutations.into(),
            max_commit_delay: options.max_commit_delay,
            return_commit_stats: options.return_commit_stats,
            transaction_tag: options.transaction_tag.clone(),
            request_options: self.request_options.clone(),
        };
        let timeout = self
            .request_options
            .effective_timeout(self.rpc.default_timeout());
        let result = rpc::call(
            Phase::Commit,
            timeout,
            self.rpc.commit(lease.name(), request),
        )
        .await;

        match &result {
            Ok(response) => {
                debug!(commit_timestamp = %response.commit_timestamp, "blind write committed");
                lease.release();
            }
            Err(err) => settle(lease, err),
        }
        result
    }

    /// Runs one DML statement as partitioned DML and returns a lower bound
    /// on the rows it touched.
    ///
    /// The server splits the statement and commits each partition on its
    /// own, so the statement must be idempotent. It is not atomic and is not
    /// retried here.
    #[instrument(skip(self, statement))]
    pub async fn run_partitioned_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        let lease = self.pool.acquire(SessionKind::Dedicated).await?;
        let timeout = self
            .request_options
            .effective_timeout(self.rpc.default_timeout());
        let result = self
            .partitioned_update(&lease, statement.into(), timeout)
            .await;

        match &result {
            Ok(row_count) => {
                debug!(row_count, "partitioned update finished");
                lease.release();
            }
            Err(err) => settle(lease, err),
        }
        result
    }

    async fn partitioned_update(
        &self,
        lease: &Lease,
        statement: Statement,
        timeout: Duration,
    ) -> Result<i64> {
        let begin = BeginTransactionRequest {
            mode: TransactionMode::PartitionedDml,
            transaction_tag: self.transaction_options.transaction_tag.clone(),
            exclude_from_change_streams: self.transaction_options.exclude_from_change_streams,
            request_options: self.request_options.clone(),
        };
        let info = rpc::call(
            Phase::Begin,
            timeout,
            self.rpc.begin_transaction(lease.name(), begin),
        )
        .await?;

        let request = ExecuteSqlRequest {
            statement,
            transaction: TransactionSelector::Id(info.id),
            partition_token: None,
            seqno: 1,
            request_options: self.request_options.clone(),
        };
        let result = rpc::call(
            Phase::Running,
            timeout,
            self.rpc.execute_update(lease.name(), request),
        )
        .await?;
        Ok(result.row_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, DbError, Status, TableSchema, Value};
    use crate::rpc::ReadSpec;
    use crate::rpc::memory::{MemoryDatabase, Method};
    use crate::session::PoolConfig;
    use crate::transaction::{KeySet, Mutation, Write};

    fn emulator() -> Arc<MemoryDatabase> {
        Arc::new(
            MemoryDatabase::new("projects/p/instances/i/databases/d".parse().unwrap()).with_table(
                TableSchema::new(
                    "Counters",
                    vec![
                        Column::new("Name", DataType::Text).not_null(),
                        Column::new("Value", DataType::Integer),
                    ],
                    vec!["Name"],
                ),
            ),
        )
    }

    #[tokio::test]
    async fn test_blind_write_commits_once() {
        let rpc = emulator();
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();

        let mut buffer = db.mutations();
        buffer
            .insert("Counters", &["Name", "Value"], vec![vec![Value::Text("hits".into()), Value::Integer(1)]])
            .unwrap();
        db.write(buffer).await.unwrap();

        assert_eq!(
            rpc.row("Counters", &vec![Value::Text("hits".into())]),
            Some(vec![Value::Text("hits".into()), Value::Integer(1)])
        );
        assert_eq!(rpc.call_count(Method::BeginTransaction), 0);
        assert_eq!(db.stats().leased_sessions, 0);
    }

    #[tokio::test]
    async fn test_blind_write_is_not_retried() {
        let rpc = emulator();
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();
        rpc.inject_failure(Method::Commit, Status::aborted("conflict"));

        let mut buffer = db.mutations();
        buffer
            .insert_or_update("Counters", &["Name", "Value"], vec![vec![Value::Text("a".into()), Value::Integer(1)]])
            .unwrap();
        let err = db.write(buffer).await.unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(rpc.call_count(Method::Commit), 1);
    }

    #[tokio::test]
    async fn test_get_transaction_aborted_commit_is_returned() {
        let rpc = emulator();
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();
        rpc.inject_failure(Method::Commit, Status::aborted("conflict"));

        let txn = db.get_transaction().await.unwrap();
        txn.insert("Counters", &["Name", "Value"], vec![vec![Value::Text("x".into()), Value::Integer(0)]])
            .unwrap();
        let err = txn.commit().await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(rpc.call_count(Method::Commit), 1);
        assert_eq!(db.stats().leased_sessions, 0);
        assert_eq!(db.stats().idle_sessions, 1);
    }

    #[tokio::test]
    async fn test_get_transaction_commit() {
        let rpc = emulator();
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();

        let txn = db.get_transaction().await.unwrap();
        txn.insert("Counters", &["Name", "Value"], vec![vec![Value::Text("y".into()), Value::Integer(9)]])
            .unwrap();
        txn.commit().await.unwrap();
        assert!(rpc.row("Counters", &vec![Value::Text("y".into())]).is_some());

        let err = db
            .run_transaction(|txn| async move {
                txn.delete("Counters", crate::transaction::KeySet::all())?;
                Err::<(), _>(DbError::ExecutionError("changed my mind".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ExecutionError(_)));
        assert!(rpc.row("Counters", &vec![Value::Text("y".into())]).is_some());
    }

    #[tokio::test]
    async fn test_lost_session_is_not_returned_to_pool() {
        let rpc = emulator();
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1).max_sessions(1))
            .await
            .unwrap();

        let txn = db.get_transaction().await.unwrap();
        let lost = txn.session().clone();
        rpc.expire_session(&lost);
        let err = txn
            .read(ReadSpec::new("Counters", &["Name"], KeySet::all()))
            .await
            .unwrap_err();
        assert!(err.is_session_broken());
        assert!(txn.session_lost());
        txn.rollback().await;

        assert_eq!(db.stats().total_sessions, 0);
        assert_eq!(rpc.call_count(Method::Rollback), 0);

        // Same again, dropping the transaction instead of rolling it back.
        let txn = db.get_transaction().await.unwrap();
        let second = txn.session().clone();
        assert_ne!(second, lost);
        rpc.expire_session(&second);
        assert!(txn.query("SELECT 1").await.is_err());
        drop(txn);
        for _ in 0..50 {
            if db.stats().total_sessions == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(db.stats().total_sessions, 0);

        let txn = db.get_transaction().await.unwrap();
        assert!(txn.session() != &lost && txn.session() != &second);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_partitioned_update_returns_row_count() {
        let rpc = emulator();
        rpc.seed(
            "Counters",
            vec![
                vec![Value::Text("a".into()), Value::Integer(4)],
                vec![Value::Text("b".into()), Value::Integer(5)],
            ],
        )
        .unwrap();
        let sql = "UPDATE Counters SET Value = 0 WHERE Value > 0";
        rpc.register_update(
            sql,
            vec![Mutation::Update(Write {
                table: "Counters".into(),
                columns: vec!["Name".into(), "Value".into()],
                values: vec![
                    vec![Value::Text("a".into()), Value::Integer(0)],
                    vec![Value::Text("b".into()), Value::Integer(0)],
                ],
            })],
        );
        let db = Database::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();

        assert_eq!(db.run_partitioned_update(sql).await.unwrap(), 2);
        assert_eq!(
            rpc.row("Counters", &vec![Value::Text("b".into())]),
            Some(vec![Value::Text("b".into()), Value::Integer(0)])
        );
        assert_eq!(rpc.call_count(Method::BeginTransaction), 1);
        assert_eq!(rpc.call_count(Method::Commit), 0);
        assert_eq!(rpc.active_transactions(), 0);
        assert_eq!(db.stats().leased_sessions, 0);

        let err = db.run_partitioned_update("DELETE FROM Counters").await.unwrap_err();
        assert!(err.status().is_some());
        assert_eq!(db.stats().idle_sessions, 1);
    }
}
