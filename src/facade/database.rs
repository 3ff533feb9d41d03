use crate::batch::{BatchTransaction, BatchTransactionId};
use crate::core::{Catalog, Result};
use crate::rpc::DatabaseRpc;
use crate::session::{DatabasePath, PoolConfig, PoolStats, SessionPool};
use crate::transaction::{
    MutationBuffer, RequestOptions, SessionKind, Snapshot, TimestampBound, TransactionOptions,
};
use std::sync::Arc;
use tracing::info;

/// Caller-facing handle to one database.
///
/// Owns the session pool; everything else borrows sessions from it. Open it
/// once, share it (it is `Send + Sync`), and [`Database::close`] it on shutdown.
pub struct Database {
    pub(super) rpc: Arc<dyn DatabaseRpc>,
    pub(super) pool: Arc<SessionPool>,
    pub(super) catalog: Option<Arc<Catalog>>,
    pub(super) transaction_options: TransactionOptions,
    pub(super) request_options: RequestOptions,
}

impl Database {
    /// Open a database handle and fill its pool to `min_sessions`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rustspan::rpc::memory::MemoryDatabase;
    /// use rustspan::{Database, PoolConfig};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let rpc = Arc::new(MemoryDatabase::new(
    ///     "projects/p/instances/i/databases/d".parse().unwrap(),
    /// ));
    /// let db = Database::open(rpc, PoolConfig::new().min_sessions(2)).await.unwrap();
    /// assert_eq!(db.stats().idle_sessions, 2);
    /// db.close().await;
    /// # });
    /// ```
    pub async fn open(rpc: Arc<dyn DatabaseRpc>, config: PoolConfig) -> Result<Self> {
        let pool = SessionPool::open(Arc::clone(&rpc), config).await?;
        info!(database = %rpc.database(), "database opened");
        Ok(Self {
            rpc,
            pool: Arc::new(pool),
            catalog: None,
            transaction_options: TransactionOptions::default(),
            request_options: RequestOptions::default(),
        })
    }

    /// Validate buffered mutations against `catalog` as they are appended.
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    /// Defaults for `run_transaction`, `get_transaction` and `write`.
    pub fn with_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.transaction_options = options;
        self
    }

    pub fn with_request_options(mut self, options: RequestOptions) -> Self {
        self.request_options = options;
        self
    }

    pub fn path(&self) -> &DatabasePath {
        self.rpc.database()
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// An empty mutation buffer wired to this database's catalog.
    pub fn mutations(&self) -> MutationBuffer {
        match &self.catalog {
            Some(catalog) => MutationBuffer::with_catalog(Arc::clone(catalog)),
            None => MutationBuffer::new(),
        }
    }

    /// Reads on the multiplexed session, each at its own timestamp.
    pub async fn single_use(&self, bound: TimestampBound) -> Result<Snapshot> {
        let lease = self.pool.acquire(SessionKind::Multiplexed).await?;
        Ok(Snapshot::single_use(lease, bound, self.request_options.clone()))
    }

    /// Reads on the multiplexed session sharing one timestamp.
    pub async fn read_only_transaction(&self, bound: TimestampBound) -> Result<Snapshot> {
        let lease = self.pool.acquire(SessionKind::Multiplexed).await?;
        Snapshot::begin(lease, bound, self.request_options.clone()).await
    }

    /// Starts a batch transaction for partitioned reads and queries.
    pub async fn batch_transaction(&self, bound: TimestampBound) -> Result<BatchTransaction> {
        BatchTransaction::begin(Arc::clone(&self.rpc), bound, self.request_options.clone()).await
    }

    /// Attaches to a batch transaction started elsewhere.
    pub fn batch_transaction_from(&self, id: BatchTransactionId) -> BatchTransaction {
        BatchTransaction::from_identifier(Arc::clone(&self.rpc), id, self.request_options.clone())
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn close(&self) -> PoolStats {
        self.pool.close().await
    }
}
