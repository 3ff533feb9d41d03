//! Partitioned reads and queries.
//!
//! A [`BatchTransaction`] pins one read timestamp on its own session. Every
//! [`Partition`] it mints carries that transaction's identity, so partitions
//! can be shipped to other processes and executed there independently.

use crate::core::{DbError, Phase, Result};
use crate::result::ResultSet;
use crate::rpc::{
    self, BeginTransactionRequest, CreateSessionRequest, DatabaseRpc, ExecuteSqlRequest,
    PartitionOptions, PartitionQueryRequest, PartitionReadRequest, PartitionToken, ReadRequest,
    ReadSpec, SessionName, Statement, TransactionId, TransactionSelector,
};
use crate::transaction::options::{RequestOptions, TimestampBound, TransactionMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Everything another process needs to execute this transaction's partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransactionId {
    pub session: SessionName,
    pub transaction: TransactionId,
    pub read_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    Query(Statement),
    Read(ReadSpec),
}

/// One independently executable slice of a read or query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub token: PartitionToken,
    pub transaction: BatchTransactionId,
    pub kind: PartitionKind,
}

/// A read-only transaction used to split and execute partitioned work.
///
/// Owns a session outside the pool. [`BatchTransaction::close`] deletes it;
/// a transaction rebuilt with [`BatchTransaction::from_identifier`] shares
/// the session and should only be closed by one side.
pub struct BatchTransaction {
    rpc: Arc<dyn DatabaseRpc>,
    id: BatchTransactionId,
    request_options: RequestOptions,
}

impl BatchTransaction {
    /// Creates a session and begins a read-only transaction at `bound`.
    #[instrument(skip(rpc, request_options))]
    pub async fn begin(
        rpc: Arc<dyn DatabaseRpc>,
        bound: TimestampBound,
        request_options: RequestOptions,
    ) -> Result<Self> {
        let timeout = request_options.effective_timeout(rpc.default_timeout());
        let session = rpc::call(
            Phase::CreateSession,
            timeout,
            rpc.create_session(CreateSessionRequest::default()),
        )
        .await?;

        let request = BeginTransactionRequest {
            mode: TransactionMode::ReadOnly(bound),
            transaction_tag: None,
            exclude_from_change_streams: false,
            request_options: request_options.clone(),
        };
        let info = match rpc::call(
            Phase::Begin,
            timeout,
            rpc.begin_transaction(&session.name, request),
        )
        .await
        {
            Ok(info) => info,
            Err(err) => {
                delete_session(rpc.as_ref(), &session.name, timeout).await;
                return Err(err);
            }
        };

        info!(
            session = %session.name,
            transaction = %info.id,
            read_timestamp = ?info.read_timestamp,
            "batch transaction started"
        );

        Ok(Self {
            rpc,
            id: BatchTransactionId {
                session: session.name,
                transaction: info.id,
                read_timestamp: info.read_timestamp,
            },
            request_options,
        })
    }

    /// Rebuilds a batch transaction from an identifier produced elsewhere.
    pub fn from_identifier(
        rpc: Arc<dyn DatabaseRpc>,
        id: BatchTransactionId,
        request_options: RequestOptions,
    ) -> Self {
        Self {
            rpc,
            id,
            request_options,
        }
    }

    pub fn identifier(&self) -> &BatchTransactionId {
        &self.id
    }

    /// The snapshot every partition reads at.
    pub fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.id.read_timestamp
    }

    fn timeout(&self) -> Duration {
        self.request_options
            .effective_timeout(self.rpc.default_timeout())
    }

    fn selector(&self) -> TransactionSelector {
        TransactionSelector::Id(self.id.transaction.clone())
    }

    /// Splits a query into partitions, in the order the server returned them.
    #[instrument(skip(self, statement, options), fields(transaction = %self.id.transaction))]
    pub async fn partition_query(
        &self,
        statement: impl Into<Statement>,
        options: PartitionOptions,
    ) -> Result<Vec<Partition>> {
        let statement = statement.into();
        let request = PartitionQueryRequest {
            statement: statement.clone(),
            transaction: self.selector(),
            options,
        };
        let response = rpc::call(
            Phase::Partition,
            self.timeout(),
            self.rpc.partition_query(&self.id.session, request),
        )
        .await?;
        debug!(partitions = response.partitions.len(), "query partitioned");

        Ok(response
            .partitions
            .into_iter()
            .map(|token| Partition {
                token,
                transaction: self.id.clone(),
                kind: PartitionKind::Query(statement.clone()),
            })
            .collect())
    }

    /// Splits a key-based read into partitions.
    #[instrument(skip(self, spec, options), fields(transaction = %self.id.transaction, table = %spec.table))]
    pub async fn partition_read(
        &self,
        spec: ReadSpec,
        options: PartitionOptions,
    ) -> Result<Vec<Partition>> {
        let request = PartitionReadRequest {
            spec: spec.clone(),
            transaction: self.selector(),
            options,
        };
        let response = rpc::call(
            Phase::Partition,
            self.timeout(),
            self.rpc.partition_read(&self.id.session, request),
        )
        .await?;
        debug!(partitions = response.partitions.len(), "read partitioned");

        Ok(response
            .partitions
            .into_iter()
            .map(|token| Partition {
                token,
                transaction: self.id.clone(),
                kind: PartitionKind::Read(spec.clone()),
            })
            .collect())
    }

    /// Streams the rows of one partition.
    ///
    /// The stream is finite and cannot be restarted; execute the partition
    /// again to re-read it.
    pub async fn execute(&self, partition: &Partition) -> Result<ResultSet> {
        if partition.transaction.transaction != self.id.transaction
            || partition.transaction.session != self.id.session
        {
            return Err(DbError::InvalidPartition(format!(
                "partition belongs to transaction {} on {}, not {}",
                partition.transaction.transaction,
                partition.transaction.session,
                self.id.transaction
            )));
        }

        let result = match &partition.kind {
            PartitionKind::Query(statement) => {
                let request = ExecuteSqlRequest {
                    statement: statement.clone(),
                    transaction: self.selector(),
                    partition_token: Some(partition.token.clone()),
                    seqno: 0,
                    request_options: self.request_options.clone(),
                };
                rpc::call(
                    Phase::Read,
                    self.timeout(),
                    self.rpc.execute_streaming_sql(&self.id.session, request),
                )
                .await?
            }
            PartitionKind::Read(spec) => {
                let request = ReadRequest {
                    spec: spec.clone(),
                    transaction: self.selector(),
                    partition_token: Some(partition.token.clone()),
                    request_options: self.request_options.clone(),
                };
                rpc::call(
                    Phase::Read,
                    self.timeout(),
                    self.rpc.streaming_read(&self.id.session, request),
                )
                .await?
            }
        };
        Ok(ResultSet::from_rpc(result, Phase::Read))
    }

    /// Deletes the session. Partitions of this transaction stop working.
    pub async fn close(self) {
        delete_session(self.rpc.as_ref(), &self.id.session, self.timeout()).await;
        info!(session = %self.id.session, "batch transaction closed");
    }
}

async fn delete_session(rpc: &dyn DatabaseRpc, session: &SessionName, timeout: Duration) {
    if let Err(err) = rpc::call(Phase::Lease, timeout, rpc.delete_session(session)).await {
        debug!(%session, error = %err, "session delete failed; ignoring");
    }
}
