//! Transport seam between the engine and the remote database service.
//!
//! [`DatabaseRpc`] is the set of calls the engine makes; a generated gRPC
//! client, a proxy, or [`memory::MemoryDatabase`] can sit behind it.

pub mod memory;

use crate::core::{DbError, Key, Phase, Result, Row, Status, Value};
use crate::session::config::DatabasePath;
use crate::transaction::mutation::{KeySet, Mutation};
use crate::transaction::options::{RequestOptions, TransactionMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub type RpcResult<T> = std::result::Result<T, Status>;

/// Rows as they come off the wire.
pub type RpcRowStream = BoxStream<'static, RpcResult<Row>>;

/// Fully qualified session resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionName(String);

impl SessionName {
    pub fn new(database: &DatabasePath, id: &str) -> Self {
        Self(format!("{}/sessions/{}", database, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing session id.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque partition descriptor minted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionToken(pub Vec<u8>);

/// Which transaction a request runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSelector {
    /// A throwaway transaction for this request only.
    SingleUse(TransactionMode),
    /// Start a transaction with this request and report its id back.
    Begin(TransactionMode),
    Id(TransactionId),
}

/// A SQL statement with named parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
}

impl Statement {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(&sql)
    }
}

/// A key-based read of some columns of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSpec {
    pub table: String,
    pub columns: Vec<String>,
    pub key_set: KeySet,
    pub limit: Option<usize>,
}

impl ReadSpec {
    pub fn new(table: &str, columns: &[&str], key_set: KeySet) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key_set,
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn single_key(table: &str, columns: &[&str], key: Key) -> Self {
        Self::new(table, columns, KeySet::key(key)).limit(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub partition_size_bytes: Option<u64>,
    pub max_partitions: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub multiplexed: bool,
    pub database_role: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub name: SessionName,
    pub create_time: DateTime<Utc>,
    pub multiplexed: bool,
}

#[derive(Debug, Clone)]
pub struct BeginTransactionRequest {
    pub mode: TransactionMode,
    pub transaction_tag: Option<String>,
    pub exclude_from_change_streams: bool,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub read_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum CommitTarget {
    Id(TransactionId),
    SingleUse(TransactionMode),
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub transaction: CommitTarget,
    pub mutations: Vec<Mutation>,
    pub max_commit_delay: Option<Duration>,
    pub return_commit_stats: bool,
    pub transaction_tag: Option<String>,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub mutation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    pub commit_timestamp: DateTime<Utc>,
    pub stats: Option<CommitStats>,
}

#[derive(Debug, Clone)]
pub struct ExecuteSqlRequest {
    pub statement: Statement,
    pub transaction: TransactionSelector,
    pub partition_token: Option<PartitionToken>,
    pub seqno: u64,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub spec: ReadSpec,
    pub transaction: TransactionSelector,
    pub partition_token: Option<PartitionToken>,
    pub request_options: RequestOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSetMetadata {
    pub columns: Vec<String>,
    /// Set when the request began a transaction inline.
    pub transaction: Option<TransactionInfo>,
}

pub struct StreamingResult {
    pub metadata: ResultSetMetadata,
    pub rows: RpcRowStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub row_count: i64,
    pub transaction: Option<TransactionInfo>,
}

#[derive(Debug, Clone)]
pub struct PartitionQueryRequest {
    pub statement: Statement,
    pub transaction: TransactionSelector,
    pub options: PartitionOptions,
}

#[derive(Debug, Clone)]
pub struct PartitionReadRequest {
    pub spec: ReadSpec,
    pub transaction: TransactionSelector,
    pub options: PartitionOptions,
}

#[derive(Debug, Clone)]
pub struct PartitionResponse {
    pub partitions: Vec<PartitionToken>,
    pub transaction: Option<TransactionInfo>,
}

/// The remote calls the engine depends on.
///
/// Implementations handle transient transport retries (UNAVAILABLE and the
/// like) themselves; every error that reaches the engine is final for that call.
#[async_trait]
pub trait DatabaseRpc: Send + Sync {
    /// The database every session is created in.
    fn database(&self) -> &DatabasePath;

    /// Longest timeout the transport allows for a single call.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn create_session(&self, request: CreateSessionRequest) -> RpcResult<SessionInfo>;

    async fn delete_session(&self, session: &SessionName) -> RpcResult<()>;

    async fn begin_transaction(
        &self,
        session: &SessionName,
        request: BeginTransactionRequest,
    ) -> RpcResult<TransactionInfo>;

    async fn commit(&self, session: &SessionName, request: CommitRequest) -> RpcResult<CommitResponse>;

    async fn rollback(&self, session: &SessionName, transaction: &TransactionId) -> RpcResult<()>;

    async fn execute_streaming_sql(
        &self,
        session: &SessionName,
        request: ExecuteSqlRequest,
    ) -> RpcResult<StreamingResult>;

    async fn execute_update(
        &self,
        session: &SessionName,
        request: ExecuteSqlRequest,
    ) -> RpcResult<UpdateResult>;

    async fn streaming_read(
        &self,
        session: &SessionName,
        request: ReadRequest,
    ) -> RpcResult<StreamingResult>;

    async fn partition_query(
        &self,
        session: &SessionName,
        request: PartitionQueryRequest,
    ) -> RpcResult<PartitionResponse>;

    async fn partition_read(
        &self,
        session: &SessionName,
        request: PartitionReadRequest,
    ) -> RpcResult<PartitionResponse>;
}

/// Runs one RPC under `timeout`, mapping failures onto [`DbError`].
pub(crate) async fn call<T, F>(phase: Phase, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = RpcResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|status| DbError::from_status(phase, status)),
        Err(_) => Err(DbError::Rpc {
            phase,
            status: Status::new(
                crate::core::Code::DeadlineExceeded,
                format!("{} call exceeded {}ms", phase, timeout.as_millis()),
            ),
        }),
    }
}
