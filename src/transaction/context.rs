use super::mutation::{KeySet, Mutation, MutationBuffer};
use super::options::{
    BeginMode, RequestOptions, TimestampBound, TransactionMode, TransactionOptions,
};
use crate::core::{Catalog, DbError, Key, Phase, Result, Row};
use crate::result::ResultSet;
use crate::rpc::{
    self, BeginTransactionRequest, CommitRequest, CommitResponse, CommitTarget, DatabaseRpc,
    ExecuteSqlRequest, ReadRequest, ReadSpec, SessionName, Statement, TransactionId,
    TransactionInfo, TransactionSelector,
};
use crate::session::{Lease, SessionHandle};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One attempt of a read-write unit of work.
///
/// Handed to the caller's closure by value; clones share the same attempt.
/// Once the attempt commits, rolls back or is discarded after an abort, every
/// call on any clone fails with [`DbError::TransactionFinished`].
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    rpc: Arc<dyn DatabaseRpc>,
    session: Arc<SessionHandle>,
    mode: TransactionMode,
    options: TransactionOptions,
    request_options: RequestOptions,
    attempt: u32,
    started_at: Instant,
    state: Mutex<ContextState>,
    /// Held by the statement carrying an inline begin until the id comes back.
    begin_gate: tokio::sync::Mutex<()>,
}

struct ContextState {
    transaction_id: Option<TransactionId>,
    mutations: MutationBuffer,
    seqno: u64,
    finished: bool,
}

impl TransactionContext {
    pub(crate) fn new(
        lease: &Lease,
        options: &TransactionOptions,
        request_options: &RequestOptions,
        catalog: Option<Arc<Catalog>>,
        attempt: u32,
    ) -> Self {
        let mutations = match catalog {
            Some(catalog) => MutationBuffer::with_catalog(catalog),
            None => MutationBuffer::new(),
        };
        Self {
            inner: Arc::new(ContextInner {
                rpc: Arc::clone(lease.rpc()),
                session: Arc::clone(lease.session()),
                mode: options.mode(),
                options: options.clone(),
                request_options: request_options.clone(),
                attempt,
                started_at: Instant::now(),
                state: Mutex::new(ContextState {
                    transaction_id: None,
                    mutations,
                    seqno: 0,
                    finished: false,
                }),
                begin_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout(&self) -> Duration {
        self.inner
            .request_options
            .effective_timeout(self.inner.rpc.default_timeout())
    }

    fn session_name(&self) -> &SessionName {
        self.inner.session.name()
    }

    pub fn session(&self) -> &SessionName {
        self.session_name()
    }

    /// Zero-based attempt number within the unit of work.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.lock_state().transaction_id.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock_state().finished
    }

    /// Issues `BeginTransaction` unless the attempt begins inline.
    pub(crate) async fn begin(&self) -> Result<()> {
        if self.inner.options.begin_mode == BeginMode::Inline {
            return Ok(());
        }
        let request = BeginTransactionRequest {
            mode: self.inner.mode,
            transaction_tag: self.inner.options.transaction_tag.clone(),
            exclude_from_change_streams: self.inner.options.exclude_from_change_streams,
            request_options: self.inner.request_options.clone(),
        };
        let info = self.observe(
            rpc::call(
                Phase::Begin,
                self.timeout(),
                self.inner.rpc.begin_transaction(self.session_name(), request),
            )
            .await,
        )?;
        debug!(session = %self.session_name(), transaction = %info.id, "transaction begun");
        self.lock_state().transaction_id = Some(info.id);
        Ok(())
    }

    /// Selector for the next statement. Holding the returned guard marks this
    /// statement as the one that begins the transaction inline.
    async fn selector(&self) -> Result<(TransactionSelector, Option<tokio::sync::MutexGuard<'_, ()>>)> {
        if let Some(id) = self.known_id()? {
            return Ok((TransactionSelector::Id(id), None));
        }
        let gate = self.inner.begin_gate.lock().await;
        if let Some(id) = self.known_id()? {
            return Ok((TransactionSelector::Id(id), None));
        }
        Ok((TransactionSelector::Begin(self.inner.mode), Some(gate)))
    }

    fn known_id(&self) -> Result<Option<TransactionId>> {
        let state = self.lock_state();
        if state.finished {
            return Err(DbError::TransactionFinished);
        }
        Ok(state.transaction_id.clone())
    }

    fn next_seqno(&self) -> u64 {
        let mut state = self.lock_state();
        state.seqno += 1;
        state.seqno
    }

    fn record_inline_begin(&self, info: Option<&TransactionInfo>) {
        if let Some(info) = info {
            let mut state = self.lock_state();
            if state.transaction_id.is_none() {
                debug!(transaction = %info.id, "transaction begun inline");
                state.transaction_id = Some(info.id.clone());
            }
        }
    }

    /// Reads rows by key inside the transaction.
    pub async fn read(&self, spec: ReadSpec) -> Result<ResultSet> {
        let (transaction, _gate) = self.selector().await?;
        let request = ReadRequest {
            spec,
            transaction,
            partition_token: None,
            request_options: self.inner.request_options.clone(),
        };
        let result = self.observe(
            rpc::call(
                Phase::Running,
                self.timeout(),
                self.inner.rpc.streaming_read(self.session_name(), request),
            )
            .await,
        )?;
        self.record_inline_begin(result.metadata.transaction.as_ref());
        Ok(ResultSet::from_rpc(result, Phase::Running))
    }

    /// Reads a single row, `None` if the key does not exist.
    pub async fn read_row(&self, table: &str, columns: &[&str], key: Key) -> Result<Option<Row>> {
        let mut rows = self
            .read(ReadSpec::single_key(table, columns, key))
            .await?
            .into_stream();
        rows.next().await.transpose()
    }

    pub async fn query(&self, statement: impl Into<Statement>) -> Result<ResultSet> {
        let (transaction, _gate) = self.selector().await?;
        let request = ExecuteSqlRequest {
            statement: statement.into(),
            transaction,
            partition_token: None,
            seqno: self.next_seqno(),
            request_options: self.inner.request_options.clone(),
        };
        let result = self.observe(
            rpc::call(
                Phase::Running,
                self.timeout(),
                self.inner
                    .rpc
                    .execute_streaming_sql(self.session_name(), request),
            )
            .await,
        )?;
        self.record_inline_begin(result.metadata.transaction.as_ref());
        Ok(ResultSet::from_rpc(result, Phase::Running))
    }

    /// Runs a DML statement, returning the number of rows it touched.
    pub async fn execute_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        let (transaction, _gate) = self.selector().await?;
        let request = ExecuteSqlRequest {
            statement: statement.into(),
            transaction,
            partition_token: None,
            seqno: self.next_seqno(),
            request_options: self.inner.request_options.clone(),
        };
        let result = self.observe(
            rpc::call(
                Phase::Running,
                self.timeout(),
                self.inner.rpc.execute_update(self.session_name(), request),
            )
            .await,
        )?;
        self.record_inline_begin(result.transaction.as_ref());
        Ok(result.row_count)
    }

    fn buffer<F>(&self, append: F) -> Result<()>
    where
        F: FnOnce(&mut MutationBuffer) -> Result<()>,
    {
        let mut state = self.lock_state();
        if state.finished {
            return Err(DbError::TransactionFinished);
        }
        append(&mut state.mutations)
    }

    pub fn insert(&self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        self.buffer(|m| m.insert(table, columns, rows))
    }

    pub fn update(&self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        self.buffer(|m| m.update(table, columns, rows))
    }

    pub fn insert_or_update(&self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        self.buffer(|m| m.insert_or_update(table, columns, rows))
    }

    pub fn replace(&self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        self.buffer(|m| m.replace(table, columns, rows))
    }

    pub fn delete(&self, table: &str, key_set: KeySet) -> Result<()> {
        self.buffer(|m| m.delete(table, key_set))
    }

    pub fn buffer_mutation(&self, mutation: Mutation) -> Result<()> {
        self.buffer(|m| m.push(mutation))
    }

    /// Mutations that the commit will carry, in append order.
    pub fn pending_mutations(&self) -> Vec<Mutation> {
        self.lock_state().mutations.mutations().to_vec()
    }

    /// Commits the attempt with its buffered mutations. Marks the context
    /// finished whatever the outcome.
    pub(crate) async fn commit(&self) -> Result<CommitResponse> {
        let (transaction, mutations) = {
            let mut state = self.lock_state();
            if state.finished {
                return Err(DbError::TransactionFinished);
            }
            state.finished = true;
            let target = match state.transaction_id.clone() {
                Some(id) => CommitTarget::Id(id),
                // Mutation-only work never began a transaction inline.
                None => CommitTarget::SingleUse(self.inner.mode),
            };
            (target, state.mutations.take())
        };

        let request = CommitRequest {
            transaction,
            mutations,
            max_commit_delay: self.inner.options.max_commit_delay,
            return_commit_stats: self.inner.options.return_commit_stats,
            transaction_tag: self.inner.options.transaction_tag.clone(),
            request_options: self.inner.request_options.clone(),
        };
        self.observe(
            rpc::call(
                Phase::Commit,
                self.timeout(),
                self.inner.rpc.commit(self.session_name(), request),
            )
            .await,
        )
    }

    /// Best-effort rollback. Marks the context finished.
    pub(crate) async fn rollback(&self) {
        let id = {
            let mut state = self.lock_state();
            if state.finished {
                return;
            }
            state.finished = true;
            state.transaction_id.clone()
        };
        let Some(id) = id else {
            return;
        };
        if !self.inner.session.is_healthy() {
            debug!(transaction = %id, "session is gone; skipping rollback");
            return;
        }
        let result = rpc::call(
            Phase::Rollback,
            self.timeout(),
            self.inner.rpc.rollback(self.session_name(), &id),
        )
        .await;
        if let Err(err) = self.observe(result) {
            debug!(transaction = %id, error = %err, "rollback failed; ignoring");
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        observe(&self.inner.session, result)
    }

    /// True once a statement found the session gone.
    pub fn session_lost(&self) -> bool {
        !self.inner.session.is_healthy()
    }

    /// Invalidates the attempt without contacting the server.
    pub(crate) fn finish(&self) {
        let mut state = self.lock_state();
        state.finished = true;
        state.mutations.clear();
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("TransactionContext")
            .field("session", self.inner.session.name())
            .field("transaction_id", &state.transaction_id)
            .field("attempt", &self.inner.attempt)
            .field("pending_mutations", &state.mutations.len())
            .field("finished", &state.finished)
            .finish()
    }
}

/// Read-only access at a fixed timestamp bound, on the multiplexed session.
///
/// Created single-use (every read picks its own timestamp) or as a
/// multi-use read-only transaction where every read shares one timestamp.
pub struct Snapshot {
    lease: Lease,
    selector: TransactionSelector,
    read_timestamp: Option<DateTime<Utc>>,
    request_options: RequestOptions,
}

impl Snapshot {
    pub(crate) fn single_use(lease: Lease, bound: TimestampBound, request_options: RequestOptions) -> Self {
        Self {
            lease,
            selector: TransactionSelector::SingleUse(TransactionMode::ReadOnly(bound)),
            read_timestamp: None,
            request_options,
        }
    }

    pub(crate) async fn begin(
        lease: Lease,
        bound: TimestampBound,
        request_options: RequestOptions,
    ) -> Result<Self> {
        let rpc = Arc::clone(lease.rpc());
        let request = BeginTransactionRequest {
            mode: TransactionMode::ReadOnly(bound),
            transaction_tag: None,
            exclude_from_change_streams: false,
            request_options: request_options.clone(),
        };
        let info = rpc::call(
            Phase::Begin,
            request_options.effective_timeout(rpc.default_timeout()),
            rpc.begin_transaction(lease.name(), request),
        )
        .await;
        let info = match observe(lease.session(), info) {
            Ok(info) => info,
            Err(err) => {
                settle(lease, &err);
                return Err(err);
            }
        };
        Ok(Self {
            lease,
            selector: TransactionSelector::Id(info.id),
            read_timestamp: info.read_timestamp,
            request_options,
        })
    }

    /// The shared read timestamp of a multi-use snapshot.
    pub fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read_timestamp
    }

    pub fn session(&self) -> &SessionName {
        self.lease.name()
    }

    fn timeout(&self) -> Duration {
        self.request_options
            .effective_timeout(self.lease.rpc().default_timeout())
    }

    pub async fn read(&self, spec: ReadSpec) -> Result<ResultSet> {
        let request = ReadRequest {
            spec,
            transaction: self.selector.clone(),
            partition_token: None,
            request_options: self.request_options.clone(),
        };
        let result = rpc::call(
            Phase::Read,
            self.timeout(),
            self.lease.rpc().streaming_read(self.lease.name(), request),
        )
        .await;
        let result = observe(self.lease.session(), result)?;
        Ok(ResultSet::from_rpc(result, Phase::Read))
    }

    pub async fn read_row(&self, table: &str, columns: &[&str], key: Key) -> Result<Option<Row>> {
        let mut rows = self
            .read(ReadSpec::single_key(table, columns, key))
            .await?
            .into_stream();
        rows.next().await.transpose()
    }

    pub async fn query(&self, statement: impl Into<Statement>) -> Result<ResultSet> {
        let request = ExecuteSqlRequest {
            statement: statement.into(),
            transaction: self.selector.clone(),
            partition_token: None,
            seqno: 0,
            request_options: self.request_options.clone(),
        };
        let result = rpc::call(
            Phase::Read,
            self.timeout(),
            self.lease
                .rpc()
                .execute_streaming_sql(self.lease.name(), request),
        )
        .await;
        let result = observe(self.lease.session(), result)?;
        Ok(ResultSet::from_rpc(result, Phase::Read))
    }

    /// Gives the lease back. Read-only transactions need no commit. A session
    /// a read found gone is dropped from the pool instead.
    pub fn close(self) {
        self.lease.release();
    }
}

/// A read-write transaction leased directly, without automatic retry.
///
/// The caller owns the outcome: an ABORTED commit is returned as-is. Dropping
/// it without committing rolls back in the background and releases the lease.
pub struct LeasedTransaction {
    context: TransactionContext,
    lease: Option<Lease>,
}

impl LeasedTransaction {
    pub(crate) async fn begin(
        lease: Lease,
        options: &TransactionOptions,
        request_options: &RequestOptions,
        catalog: Option<Arc<Catalog>>,
    ) -> Result<Self> {
        let context = TransactionContext::new(&lease, options, request_options, catalog, 0);
        if let Err(err) = context.begin().await {
            context.finish();
            settle(lease, &err);
            return Err(err);
        }
        Ok(Self {
            context,
            lease: Some(lease),
        })
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub async fn commit(mut self) -> Result<CommitResponse> {
        let result = self.context.commit().await;
        if let Some(lease) = self.lease.take() {
            match &result {
                Err(err) => settle(lease, err),
                Ok(_) => lease.release(),
            }
        }
        result
    }

    pub async fn rollback(mut self) {
        self.context.rollback().await;
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl std::ops::Deref for LeasedTransaction {
    type Target = TransactionContext;

    fn deref(&self) -> &TransactionContext {
        &self.context
    }
}

impl Drop for LeasedTransaction {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if self.context.is_finished() {
            return;
        }
        let context = self.context.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    context.rollback().await;
                    lease.release();
                });
            }
            Err(_) => {
                warn!(session = %lease.name(), "transaction dropped outside a runtime; not rolled back");
                context.finish();
            }
        }
    }
}

/// Marks the session unhealthy when `result` shows the server lost it.
/// Leases on an unhealthy session settle as invalidated.
pub(crate) fn observe<T>(session: &SessionHandle, result: Result<T>) -> Result<T> {
    if let Err(err) = &result
        && err.is_session_broken()
    {
        session.mark_unhealthy();
    }
    result
}

/// Releases the lease unless the error shows the session is gone.
pub(crate) fn settle(lease: Lease, err: &DbError) {
    if err.is_session_broken() {
        lease.invalidate(&err.to_string());
    } else {
        lease.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, TableSchema, Value};
    use crate::rpc::memory::{MemoryDatabase, Method};
    use crate::session::{PoolConfig, SessionPool};
    use crate::transaction::options::SessionKind;

    async fn setup() -> (Arc<MemoryDatabase>, SessionPool) {
        let rpc = Arc::new(
            MemoryDatabase::new("projects/p/instances/i/databases/d".parse().unwrap()).with_table(
                TableSchema::new(
                    "Accounts",
                    vec![
                        Column::new("Id", DataType::Integer).not_null(),
                        Column::new("Balance", DataType::Integer),
                    ],
                    vec!["Id"],
                ),
            ),
        );
        let pool = SessionPool::open(rpc.clone(), PoolConfig::new().min_sessions(1))
            .await
            .unwrap();
        (rpc, pool)
    }

    #[tokio::test]
    async fn test_context_rejects_use_after_finish() {
        let (_rpc, pool) = setup().await;
        let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
        let ctx = TransactionContext::new(&lease, &TransactionOptions::new(), &RequestOptions::new(), None, 0);
        ctx.begin().await.unwrap();
        ctx.insert("Accounts", &["Id", "Balance"], vec![vec![Value::Integer(1), Value::Integer(10)]])
            .unwrap();
        assert_eq!(ctx.pending_mutations().len(), 1);

        ctx.finish();
        assert!(ctx.is_finished());
        assert!(ctx.pending_mutations().is_empty());
        let err = ctx
            .insert("Accounts", &["Id", "Balance"], vec![vec![Value::Integer(2), Value::Integer(0)]])
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionFinished));
        assert!(matches!(ctx.query("SELECT 1").await, Err(DbError::TransactionFinished)));
    }

    #[tokio::test]
    async fn test_inline_begin_skips_begin_rpc() {
        let (rpc, pool) = setup().await;
        let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
        let options = TransactionOptions::new().begin_mode(BeginMode::Inline);
        let ctx = TransactionContext::new(&lease, &options, &RequestOptions::new(), None, 0);

        ctx.begin().await.unwrap();
        assert!(ctx.transaction_id().is_none());

        let rows = ctx
            .read(ReadSpec::new("Accounts", &["Id"], KeySet::all()))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(ctx.transaction_id().is_some());
        assert_eq!(rpc.call_count(Method::BeginTransaction), 0);

        ctx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_only_inline_commits_single_use() {
        let (rpc, pool) = setup().await;
        let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
        let options = TransactionOptions::new().begin_mode(BeginMode::Inline);
        let ctx = TransactionContext::new(&lease, &options, &RequestOptions::new(), None, 0);

        ctx.insert("Accounts", &["Id", "Balance"], vec![vec![Value::Integer(7), Value::Integer(70)]])
            .unwrap();
        ctx.commit().await.unwrap();

        assert_eq!(
            rpc.row("Accounts", &vec![Value::Integer(7)]),
            Some(vec![Value::Integer(7), Value::Integer(70)])
        );
        assert!(matches!(ctx.commit().await, Err(DbError::TransactionFinished)));
    }

    #[tokio::test]
    async fn test_leased_transaction_drop_rolls_back() {
        let (rpc, pool) = setup().await;
        let lease = pool.acquire(SessionKind::Dedicated).await.unwrap();
        let txn = LeasedTransaction::begin(lease, &TransactionOptions::new(), &RequestOptions::new(), None)
            .await
            .unwrap();
        txn.insert("Accounts", &["Id", "Balance"], vec![vec![Value::Integer(3), Value::Integer(0)]])
            .unwrap();
        drop(txn);

        // Rollback runs on a spawned task.
        for _ in 0..50 {
            if pool.stats().leased_sessions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.stats().leased_sessions, 0);
        assert_eq!(rpc.call_count(Method::Rollback), 1);
        assert_eq!(rpc.row("Accounts", &vec![Value::Integer(3)]), None);
    }
}
