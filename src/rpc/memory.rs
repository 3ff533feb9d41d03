// ============================================================================
// In-memory database service
// ============================================================================
//
// Emulates the remote service behind `DatabaseRpc` inside the process:
// sessions, multi-version rows stamped with commit timestamps, read-write
// transactions validated optimistically at commit (a key read or written
// after the transaction's snapshot aborts it), read-only snapshots and
// partitioning. Used by the tests and the bench binary.
//
// Faults can be queued per method and every call is counted.
//
// ============================================================================

use super::{
    BeginTransactionRequest, CommitRequest, CommitResponse, CommitStats, CommitTarget,
    CreateSessionRequest, DatabaseRpc, ExecuteSqlRequest, PartitionQueryRequest,
    PartitionReadRequest, PartitionResponse, PartitionToken, ReadRequest, ResultSetMetadata,
    RpcResult, SessionInfo, SessionName, StreamingResult, TransactionId, TransactionInfo,
    TransactionSelector, UpdateResult,
};
use crate::core::{Catalog, Code, DbError, Key, Result, Row, Status, TableSchema, Value};
use crate::session::config::DatabasePath;
use crate::transaction::mutation::{KeyRange, KeySet, Mutation};
use crate::transaction::options::{TimestampBound, TransactionMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Partitions minted when the request does not ask for a count.
const DEFAULT_PARTITIONS: usize = 4;

/// The RPCs of [`DatabaseRpc`], for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    CreateSession,
    DeleteSession,
    BeginTransaction,
    Commit,
    Rollback,
    ExecuteStreamingSql,
    ExecuteUpdate,
    StreamingRead,
    PartitionQuery,
    PartitionRead,
}

pub struct MemoryDatabase {
    database: DatabasePath,
    latency: Duration,
    state: Mutex<EmulatorState>,
}

struct Version {
    ts: i64,
    /// `None` marks a delete.
    row: Option<Row>,
}

type Versions = HashMap<String, BTreeMap<Key, Vec<Version>>>;

struct TxnState {
    session: SessionName,
    read_only: bool,
    /// Partitioned DML: its one statement commits as it executes.
    partitioned_dml: bool,
    read_ts: i64,
    /// Key sets read, checked for later commits by others.
    reads: Vec<(String, KeySet)>,
    /// DML effects, applied with the commit.
    writes: Vec<Mutation>,
}

struct PartitionScope {
    transaction: TransactionId,
    key_set: KeySet,
}

#[derive(Default)]
struct EmulatorState {
    catalog: Catalog,
    tables: Versions,
    clock: i64,
    next_id: u64,
    sessions: HashMap<SessionName, bool>,
    transactions: HashMap<TransactionId, TxnState>,
    partitions: HashMap<Vec<u8>, PartitionScope>,
    dml: HashMap<String, Vec<Mutation>>,
    failures: HashMap<Method, VecDeque<Status>>,
    calls: HashMap<Method, usize>,
    database_missing: bool,
}

impl MemoryDatabase {
    pub fn new(database: DatabasePath) -> Self {
        Self {
            database,
            latency: Duration::ZERO,
            state: Mutex::new(EmulatorState::default()),
        }
    }

    pub fn with_table(self, schema: TableSchema) -> Self {
        self.create_table(schema);
        self
    }

    /// Delay every call by `latency` before it is handled.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn create_table(&self, schema: TableSchema) {
        let mut state = self.lock();
        state.tables.entry(schema.name().to_string()).or_default();
        state.catalog.add_table(schema);
    }

    pub fn catalog(&self) -> Catalog {
        self.lock().catalog.clone()
    }

    /// Commits full rows (in column order) outside any transaction.
    pub fn seed(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut state = self.lock();
        let schema = state.catalog.get_table(table)?;
        let columns: Vec<String> = schema.columns().iter().map(|c| c.name.clone()).collect();
        let mutation = Mutation::InsertOrUpdate(crate::transaction::mutation::Write {
            table: table.to_string(),
            columns,
            values: rows,
        });
        state
            .apply_commit(None, &[], vec![mutation], false)
            .map(|_| ())
            .map_err(|status| DbError::ExecutionError(status.to_string()))
    }

    /// Makes `execute_update(sql)` apply `mutations` inside the caller's transaction.
    pub fn register_update(&self, sql: &str, mutations: Vec<Mutation>) {
        self.lock().dml.insert(normalize(sql), mutations);
    }

    /// Queues a failure returned by the next call to `method`.
    pub fn inject_failure(&self, method: Method, status: Status) {
        self.lock()
            .failures
            .entry(method)
            .or_default()
            .push_back(status);
    }

    pub fn call_count(&self, method: Method) -> usize {
        self.lock().calls.get(&method).copied().unwrap_or(0)
    }

    /// Forgets a session as if the server had garbage-collected it.
    pub fn expire_session(&self, session: &SessionName) {
        self.lock().sessions.remove(session);
    }

    /// Every call fails with `Database not found` while set.
    pub fn set_database_missing(&self, missing: bool) {
        self.lock().database_missing = missing;
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn active_transactions(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Latest committed version of a row.
    pub fn row(&self, table: &str, key: &Key) -> Option<Row> {
        let state = self.lock();
        visible(&state.tables, table, key, i64::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Counts the call and surfaces queued or database-wide failures.
    fn enter(&self, method: Method) -> RpcResult<MutexGuard<'_, EmulatorState>> {
        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        trace!(?method, "emulator call");
        if let Some(status) = state.failures.get_mut(&method).and_then(VecDeque::pop_front) {
            return Err(status);
        }
        if state.database_missing {
            return Err(Status::not_found(format!(
                "Database not found: {}",
                self.database
            )));
        }
        Ok(state)
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts).unwrap_or_default()
}

fn schema_status(err: DbError) -> Status {
    match err {
        DbError::TableNotFound(table) => Status::not_found(format!("Table not found: {}", table)),
        other => Status::invalid_argument(other.to_string()),
    }
}

fn visible(tables: &Versions, table: &str, key: &Key, read_ts: i64) -> Option<Row> {
    tables
        .get(table)?
        .get(key)?
        .iter()
        .rev()
        .find(|v| v.ts <= read_ts)
        .and_then(|v| v.row.clone())
}

/// Uncommitted changes layered over the committed rows visible at `read_ts`.
struct Staging<'a> {
    tables: &'a Versions,
    catalog: &'a Catalog,
    read_ts: i64,
    changes: BTreeMap<(String, Key), Option<Row>>,
}

impl<'a> Staging<'a> {
    fn new(tables: &'a Versions, catalog: &'a Catalog, read_ts: i64) -> Self {
        Self {
            tables,
            catalog,
            read_ts,
            changes: BTreeMap::new(),
        }
    }

    fn current(&self, table: &str, key: &Key) -> Option<Row> {
        match self.changes.get(&(table.to_string(), key.clone())) {
            Some(staged) => staged.clone(),
            None => visible(self.tables, table, key, self.read_ts),
        }
    }

    /// All live rows of `table`, in key order.
    fn rows(&self, table: &str) -> BTreeMap<Key, Row> {
        let mut rows: BTreeMap<Key, Row> = self
            .tables
            .get(table)
            .into_iter()
            .flat_map(|keys| keys.keys())
            .filter_map(|key| {
                visible(self.tables, table, key, self.read_ts).map(|row| (key.clone(), row))
            })
            .collect();
        for ((t, key), staged) in &self.changes {
            if t != table {
                continue;
            }
            match staged {
                Some(row) => rows.insert(key.clone(), row.clone()),
                None => rows.remove(key),
            };
        }
        rows
    }

    fn apply(&mut self, mutation: &Mutation) -> RpcResult<()> {
        let schema = self
            .catalog
            .get_table(mutation.table())
            .map_err(schema_status)?;

        let Some(write) = mutation.write() else {
            if let Mutation::Delete { table, key_set } = mutation {
                let doomed: Vec<Key> = self
                    .rows(table)
                    .into_keys()
                    .filter(|key| key_set.contains(key))
                    .collect();
                for key in doomed {
                    self.changes.insert((table.clone(), key), None);
                }
            }
            return Ok(());
        };

        let positions = schema
            .resolve_columns(&write.columns)
            .map_err(schema_status)?;
        for values in &write.values {
            schema
                .validate_row(&write.columns, values)
                .map_err(schema_status)?;
            let key = schema.key_of(&write.columns, values).map_err(schema_status)?;
            let existing = self.current(&write.table, &key);

            let mut row = match (mutation, existing) {
                (Mutation::Insert(_), Some(_)) => {
                    return Err(Status::new(
                        Code::AlreadyExists,
                        format!("Row {:?} in table {} already exists", key, write.table),
                    ));
                }
                (Mutation::Update(_), None) => {
                    return Err(Status::not_found(format!(
                        "Row {:?} not found in table {}",
                        key, write.table
                    )));
                }
                (Mutation::Update(_) | Mutation::InsertOrUpdate(_), Some(row)) => row,
                _ => vec![Value::Null; schema.column_count()],
            };
            for (pos, value) in positions.iter().zip(values) {
                row[*pos] = value.clone();
            }
            if let Some(column) = schema
                .columns()
                .iter()
                .zip(&row)
                .find(|(column, value)| !column.nullable && value.is_null())
                .map(|(column, _)| column)
            {
                return Err(Status::new(
                    Code::FailedPrecondition,
                    format!("{}.{} must not be NULL", write.table, column.name),
                ));
            }
            self.changes.insert((write.table.clone(), key), Some(row));
        }
        Ok(())
    }
}

impl EmulatorState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    /// Timestamp for a new commit, strictly after every timestamp handed out.
    fn commit_timestamp(&mut self) -> i64 {
        self.clock = (self.clock + 1).max(now_micros());
        self.clock
    }

    /// A read timestamp no later commit can land on.
    fn read_timestamp(&mut self, bound: TimestampBound) -> i64 {
        let now = now_micros();
        let ts = match bound {
            TimestampBound::Strong => now.max(self.clock),
            TimestampBound::ExactStaleness(staleness) => {
                now - i64::try_from(staleness.as_micros()).unwrap_or(i64::MAX / 2)
            }
            TimestampBound::ReadTimestamp(at) => at.timestamp_micros().min(now.max(self.clock)),
        };
        self.clock = self.clock.max(ts);
        ts
    }

    fn check_session(&self, session: &SessionName) -> RpcResult<()> {
        if self.sessions.contains_key(session) {
            Ok(())
        } else {
            Err(Status::not_found(format!("Session not found: {}", session)))
        }
    }

    fn begin(&mut self, session: &SessionName, mode: TransactionMode) -> TransactionInfo {
        let (read_only, bound) = match mode {
            TransactionMode::ReadOnly(bound) => (true, bound),
            TransactionMode::ReadWrite { .. } | TransactionMode::PartitionedDml => {
                (false, TimestampBound::Strong)
            }
        };
        let read_ts = self.read_timestamp(bound);
        let id = TransactionId(self.next_id("txn-"));
        self.transactions.insert(
            id.clone(),
            TxnState {
                session: session.clone(),
                read_only,
                partitioned_dml: mode == TransactionMode::PartitionedDml,
                read_ts,
                reads: Vec::new(),
                writes: Vec::new(),
            },
        );
        TransactionInfo {
            id,
            read_timestamp: read_only.then(|| to_datetime(read_ts)),
        }
    }

    fn transaction(&self, session: &SessionName, id: &TransactionId) -> RpcResult<&TxnState> {
        let txn = self.transactions.get(id).ok_or_else(|| {
            Status::new(
                Code::FailedPrecondition,
                format!("Transaction not found: {}", id),
            )
        })?;
        if &txn.session != session {
            return Err(Status::new(
                Code::FailedPrecondition,
                format!("Transaction {} belongs to another session", id),
            ));
        }
        Ok(txn)
    }

    /// Resolves the selector to a read timestamp and, unless single-use, a
    /// transaction id. Also reports a transaction begun by this request.
    fn resolve(
        &mut self,
        session: &SessionName,
        selector: &TransactionSelector,
    ) -> RpcResult<(i64, Option<TransactionId>, Option<TransactionInfo>)> {
        match selector {
            TransactionSelector::SingleUse(TransactionMode::ReadOnly(bound)) => {
                Ok((self.read_timestamp(*bound), None, None))
            }
            TransactionSelector::SingleUse(_) => Err(Status::invalid_argument(
                "single-use read-write transactions are only valid for commit",
            )),
            TransactionSelector::Begin(TransactionMode::PartitionedDml) => Err(
                Status::invalid_argument("partitioned DML transactions must be begun explicitly"),
            ),
            TransactionSelector::Begin(mode) => {
                let info = self.begin(session, *mode);
                let read_ts = self.transactions.get(&info.id).map_or(0, |t| t.read_ts);
                Ok((read_ts, Some(info.id.clone()), Some(info)))
            }
            TransactionSelector::Id(id) => {
                let txn = self.transaction(session, id)?;
                Ok((txn.read_ts, Some(id.clone()), None))
            }
        }
    }

    /// Rows of `table` matching `key_set` as seen by the transaction.
    #[allow(clippy::too_many_arguments)]
    fn scan(
        &mut self,
        txn: Option<&TransactionId>,
        read_ts: i64,
        table: &str,
        columns: &[String],
        key_set: &KeySet,
        scope: Option<&KeySet>,
        limit: Option<usize>,
    ) -> RpcResult<Vec<Row>> {
        let schema = self.catalog.get_table(table).map_err(schema_status)?;
        let positions = schema.resolve_columns(columns).map_err(schema_status)?;

        let overlay: &[Mutation] = txn
            .and_then(|id| self.transactions.get(id))
            .map_or(&[][..], |t| t.writes.as_slice());
        let mut staging = Staging::new(&self.tables, &self.catalog, read_ts);
        for mutation in overlay {
            staging.apply(mutation)?;
        }

        let rows: Vec<Row> = staging
            .rows(table)
            .into_iter()
            .filter(|(key, _)| key_set.contains(key) && scope.is_none_or(|s| s.contains(key)))
            .map(|(_, row)| positions.iter().map(|&pos| row[pos].clone()).collect())
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        if let Some(txn) = txn.and_then(|id| self.transactions.get_mut(id))
            && !txn.read_only
        {
            txn.reads.push((table.to_string(), key_set.clone()));
        }
        Ok(rows)
    }

    fn partition_scope(
        &self,
        token: Option<&PartitionToken>,
        txn: Option<&TransactionId>,
    ) -> RpcResult<Option<KeySet>> {
        let Some(token) = token else {
            return Ok(None);
        };
        let scope = self
            .partitions
            .get(&token.0)
            .ok_or_else(|| Status::invalid_argument("unknown partition token"))?;
        if Some(&scope.transaction) != txn {
            return Err(Status::invalid_argument(
                "partition token does not belong to this transaction",
            ));
        }
        Ok(Some(scope.key_set.clone()))
    }

    /// Splits the rows visible to a read-only transaction into key ranges.
    fn partition(
        &mut self,
        session: &SessionName,
        selector: &TransactionSelector,
        table: &str,
        max_partitions: Option<usize>,
    ) -> RpcResult<PartitionResponse> {
        let (read_ts, txn, begun) = self.resolve(session, selector)?;
        let Some(txn) = txn else {
            return Err(Status::invalid_argument(
                "partitioning requires a read-only transaction",
            ));
        };
        if self.transactions.get(&txn).is_some_and(|t| !t.read_only) {
            return Err(Status::invalid_argument(
                "partitioning requires a read-only transaction",
            ));
        }
        self.catalog.get_table(table).map_err(schema_status)?;

        let keys: Vec<Key> = Staging::new(&self.tables, &self.catalog, read_ts)
            .rows(table)
            .into_keys()
            .collect();
        let count = max_partitions.unwrap_or(DEFAULT_PARTITIONS).max(1);
        let ranges: Vec<KeySet> = if keys.is_empty() {
            vec![KeySet::all()]
        } else {
            let chunk = keys.len().div_ceil(count);
            keys.chunks(chunk)
                .map(|chunk| {
                    let first = chunk.first().cloned().unwrap_or_default();
                    let last = chunk.last().cloned().unwrap_or_default();
                    KeySet::range(KeyRange::closed_closed(first, last))
                })
                .collect()
        };

        let mut partitions = Vec::with_capacity(ranges.len());
        for key_set in ranges {
            let token = self.next_id(&format!("{}/partition-", txn)).into_bytes();
            self.partitions.insert(
                token.clone(),
                PartitionScope {
                    transaction: txn.clone(),
                    key_set,
                },
            );
            partitions.push(PartitionToken(token));
        }
        Ok(PartitionResponse {
            partitions,
            transaction: begun,
        })
    }

    /// Validates and applies one commit atomically.
    ///
    /// `snapshot` is the committing transaction's read timestamp; any key it
    /// read or writes that changed after it aborts the commit.
    fn apply_commit(
        &mut self,
        snapshot: Option<i64>,
        reads: &[(String, KeySet)],
        mutations: Vec<Mutation>,
        return_stats: bool,
    ) -> RpcResult<CommitResponse> {
        if let Some(start) = snapshot
            && self.conflicts(start, reads, &mutations)
        {
            return Err(Status::aborted(
                "Transaction was aborted due to a conflicting concurrent commit",
            ));
        }

        let changes = {
            let mut staging = Staging::new(&self.tables, &self.catalog, i64::MAX);
            for mutation in &mutations {
                staging.apply(mutation)?;
            }
            staging.changes
        };

        let ts = self.commit_timestamp();
        for ((table, key), row) in changes {
            self.tables
                .entry(table)
                .or_default()
                .entry(key)
                .or_default()
                .push(Version { ts, row });
        }

        let stats = return_stats.then(|| CommitStats {
            mutation_count: mutations.iter().map(|m| m.row_count() as u64).sum(),
        });
        Ok(CommitResponse {
            commit_timestamp: to_datetime(ts),
            stats,
        })
    }

    fn conflicts(&self, start: i64, reads: &[(String, KeySet)], mutations: &[Mutation]) -> bool {
        let changed_since = |table: &str, matches: &dyn Fn(&Key) -> bool| -> bool {
            self.tables.get(table).is_some_and(|keys| {
                keys.iter().any(|(key, versions)| {
                    matches(key) && versions.last().is_some_and(|v| v.ts > start)
                })
            })
        };

        if reads
            .iter()
            .any(|(table, key_set)| changed_since(table, &|key: &Key| key_set.contains(key)))
        {
            return true;
        }

        mutations.iter().any(|mutation| match mutation {
            Mutation::Delete { table, key_set } => {
                changed_since(table, &|key: &Key| key_set.contains(key))
            }
            _ => {
                let Some(write) = mutation.write() else {
                    return false;
                };
                let Ok(schema) = self.catalog.get_table(&write.table) else {
                    return false;
                };
                let keys: Vec<Key> = write
                    .values
                    .iter()
                    .filter_map(|values| schema.key_of(&write.columns, values).ok())
                    .collect();
                changed_since(&write.table, &|key: &Key| keys.contains(key))
            }
        })
    }
}

/// `SELECT <columns|*> FROM <table>`; anything else is rejected.
fn parse_select(sql: &str, catalog: &Catalog) -> RpcResult<(String, Vec<String>)> {
    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let from = tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case("FROM"))
        .filter(|&idx| idx > 1 && tokens[0].eq_ignore_ascii_case("SELECT") && idx + 2 == tokens.len())
        .ok_or_else(|| Status::invalid_argument(format!("unsupported statement: {}", sql)))?;

    let table = tokens[from + 1].trim_end_matches(';').to_string();
    let projection = tokens[1..from].join(" ");
    let columns = if projection.trim() == "*" {
        catalog
            .get_table(&table)
            .map_err(schema_status)?
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    } else {
        projection
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };
    Ok((table, columns))
}

fn is_select_one(sql: &str) -> bool {
    normalize(sql).eq_ignore_ascii_case("SELECT 1")
}

fn streaming(columns: Vec<String>, rows: Vec<Row>, transaction: Option<TransactionInfo>) -> StreamingResult {
    StreamingResult {
        metadata: ResultSetMetadata {
            columns,
            transaction,
        },
        rows: stream::iter(rows.into_iter().map(Ok)).boxed(),
    }
}

#[async_trait]
impl DatabaseRpc for MemoryDatabase {
    fn database(&self) -> &DatabasePath {
        &self.database
    }

    async fn create_session(&self, request: CreateSessionRequest) -> RpcResult<SessionInfo> {
        self.pause().await;
        let mut state = self.enter(Method::CreateSession)?;
        let name = SessionName::new(&self.database, &state.next_id("s"));
        state.sessions.insert(name.clone(), request.multiplexed);
        Ok(SessionInfo {
            name,
            create_time: Utc::now(),
            multiplexed: request.multiplexed,
        })
    }

    async fn delete_session(&self, session: &SessionName) -> RpcResult<()> {
        self.pause().await;
        let mut state = self.enter(Method::DeleteSession)?;
        state.check_session(session)?;
        state.sessions.remove(session);
        state.transactions.retain(|_, txn| &txn.session != session);
        Ok(())
    }

    async fn begin_transaction(
        &self,
        session: &SessionName,
        request: BeginTransactionRequest,
    ) -> RpcResult<TransactionInfo> {
        self.pause().await;
        let mut state = self.enter(Method::BeginTransaction)?;
        state.check_session(session)?;
        Ok(state.begin(session, request.mode))
    }

    async fn commit(&self, session: &SessionName, request: CommitRequest) -> RpcResult<CommitResponse> {
        self.pause().await;
        let mut state = self.enter(Method::Commit)?;
        state.check_session(session)?;

        let (snapshot, reads, mut mutations) = match &request.transaction {
            CommitTarget::Id(id) => {
                state.transaction(session, id)?;
                let Some(txn) = state.transactions.remove(id) else {
                    return Err(Status::new(Code::FailedPrecondition, "Transaction not found"));
                };
                if txn.read_only {
                    return Err(Status::new(
                        Code::FailedPrecondition,
                        "Cannot commit a read-only transaction",
                    ));
                }
                if txn.partitioned_dml {
                    return Err(Status::new(
                        Code::FailedPrecondition,
                        "Cannot commit a partitioned DML transaction",
                    ));
                }
                (Some(txn.read_ts), txn.reads, txn.writes)
            }
            CommitTarget::SingleUse(mode) => {
                if !mode.is_read_write() {
                    return Err(Status::invalid_argument(
                        "single-use commit requires a read-write transaction",
                    ));
                }
                (None, Vec::new(), Vec::new())
            }
        };
        mutations.extend(request.mutations);
        state.apply_commit(snapshot, &reads, mutations, request.return_commit_stats)
    }

    async fn rollback(&self, session: &SessionName, transaction: &TransactionId) -> RpcResult<()> {
        self.pause().await;
        let mut state = self.enter(Method::Rollback)?;
        state.check_session(session)?;
        state.transactions.remove(transaction);
        Ok(())
    }

    async fn execute_streaming_sql(
        &self,
        session: &SessionName,
        request: ExecuteSqlRequest,
    ) -> RpcResult<StreamingResult> {
        self.pause().await;
        let mut state = self.enter(Method::ExecuteStreamingSql)?;
        state.check_session(session)?;

        if is_select_one(&request.statement.sql) {
            let (_, _, begun) = state.resolve(session, &request.transaction)?;
            return Ok(streaming(vec![String::new()], vec![vec![Value::Integer(1)]], begun));
        }

        let (table, columns) = parse_select(&request.statement.sql, &state.catalog)?;
        let (read_ts, txn, begun) = state.resolve(session, &request.transaction)?;
        let scope = state.partition_scope(request.partition_token.as_ref(), txn.as_ref())?;
        let rows = state.scan(
            txn.as_ref(),
            read_ts,
            &table,
            &columns,
            &KeySet::all(),
            scope.as_ref(),
            None,
        )?;
        Ok(streaming(columns, rows, begun))
    }

    async fn execute_update(
        &self,
        session: &SessionName,
        request: ExecuteSqlRequest,
    ) -> RpcResult<UpdateResult> {
        self.pause().await;
        let mut state = self.enter(Method::ExecuteUpdate)?;
        state.check_session(session)?;

        let mutations = state
            .dml
            .get(&normalize(&request.statement.sql))
            .cloned()
            .ok_or_else(|| {
                Status::invalid_argument(format!("unsupported DML: {}", request.statement.sql))
            })?;
        let (read_ts, txn, begun) = state.resolve(session, &request.transaction)?;
        let Some(txn) = txn.filter(|id| state.transactions.get(id).is_some_and(|t| !t.read_only))
        else {
            return Err(Status::invalid_argument(
                "DML requires a read-write transaction",
            ));
        };

        if state.transactions.get(&txn).is_some_and(|t| t.partitioned_dml) {
            // One statement per partitioned DML transaction, committed as it runs.
            state.transactions.remove(&txn);
            let row_count = mutations.iter().map(|m| m.row_count() as i64).sum();
            state.apply_commit(None, &[], mutations, false)?;
            return Ok(UpdateResult {
                row_count,
                transaction: begun,
            });
        }

        // Validate against what the transaction already wrote.
        {
            let state = &*state;
            let mut staging = Staging::new(&state.tables, &state.catalog, read_ts);
            let prior = state.transactions.get(&txn).map_or(&[][..], |t| t.writes.as_slice());
            for mutation in prior.iter().chain(&mutations) {
                staging.apply(mutation)?;
            }
        }

        let row_count: i64 = mutations.iter().map(|m| m.row_count() as i64).sum();
        if let Some(txn) = state.transactions.get_mut(&txn) {
            txn.writes.extend(mutations);
        }
        Ok(UpdateResult {
            row_count,
            transaction: begun,
        })
    }

    async fn streaming_read(
        &self,
        session: &SessionName,
        request: ReadRequest,
    ) -> RpcResult<StreamingResult> {
        self.pause().await;
        let mut state = self.enter(Method::StreamingRead)?;
        state.check_session(session)?;

        let (read_ts, txn, begun) = state.resolve(session, &request.transaction)?;
        let scope = state.partition_scope(request.partition_token.as_ref(), txn.as_ref())?;
        let spec = request.spec;
        let rows = state.scan(
            txn.as_ref(),
            read_ts,
            &spec.table,
            &spec.columns,
            &spec.key_set,
            scope.as_ref(),
            spec.limit,
        )?;
        Ok(streaming(spec.columns, rows, begun))
    }

    async fn partition_query(
        &self,
        session: &SessionName,
        request: PartitionQueryRequest,
    ) -> RpcResult<PartitionResponse> {
        self.pause().await;
        let mut state = self.enter(Method::PartitionQuery)?;
        state.check_session(session)?;
        let (table, _) = parse_select(&request.statement.sql, &state.catalog)?;
        state.partition(
            session,
            &request.transaction,
            &table,
            request.options.max_partitions,
        )
    }

    async fn partition_read(
        &self,
        session: &SessionName,
        request: PartitionReadRequest,
    ) -> RpcResult<PartitionResponse> {
        self.pause().await;
        let mut state = self.enter(Method::PartitionRead)?;
        state.check_session(session)?;
        state.partition(
            session,
            &request.transaction,
            &request.spec.table,
            request.options.max_partitions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType};
    use crate::rpc::Statement;
    use crate::transaction::mutation::Write;
    use crate::transaction::options::{IsolationLevel, ReadLockMode, RequestOptions};
    use futures::TryStreamExt;

    const RW: TransactionMode = TransactionMode::ReadWrite {
        isolation_level: IsolationLevel::Unspecified,
        read_lock_mode: ReadLockMode::Unspecified,
    };

    fn db() -> MemoryDatabase {
        MemoryDatabase::new("projects/p/instances/i/databases/d".parse().unwrap()).with_table(
            TableSchema::new(
                "Singers",
                vec![
                    Column::new("SingerId", DataType::Integer).not_null(),
                    Column::new("Name", DataType::Text),
                ],
                vec!["SingerId"],
            ),
        )
    }

    fn singer(id: i64, name: &str) -> Mutation {
        Mutation::InsertOrUpdate(Write {
            table: "Singers".into(),
            columns: vec!["SingerId".into(), "Name".into()],
            values: vec![vec![Value::Integer(id), Value::Text(name.into())]],
        })
    }

    async fn session(db: &MemoryDatabase) -> SessionName {
        db.create_session(CreateSessionRequest::default()).await.unwrap().name
    }

    fn begin_request(mode: TransactionMode) -> BeginTransactionRequest {
        BeginTransactionRequest {
            mode,
            transaction_tag: None,
            exclude_from_change_streams: false,
            request_options: RequestOptions::default(),
        }
    }

    fn commit_request(id: TransactionId, mutations: Vec<Mutation>) -> CommitRequest {
        CommitRequest {
            transaction: CommitTarget::Id(id),
            mutations,
            max_commit_delay: None,
            return_commit_stats: true,
            transaction_tag: None,
            request_options: RequestOptions::default(),
        }
    }

    fn read_request(selector: TransactionSelector) -> ReadRequest {
        ReadRequest {
            spec: crate::rpc::ReadSpec::new("Singers", &["SingerId", "Name"], KeySet::all()),
            transaction: selector,
            partition_token: None,
            request_options: RequestOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_conflicting_commit_aborts() {
        let db = db();
        let s1 = session(&db).await;
        let s2 = session(&db).await;

        let t1 = db.begin_transaction(&s1, begin_request(RW)).await.unwrap();
        db.streaming_read(&s1, read_request(TransactionSelector::Id(t1.id.clone())))
            .await
            .unwrap();

        let t2 = db.begin_transaction(&s2, begin_request(RW)).await.unwrap();
        db.commit(&s2, commit_request(t2.id, vec![singer(1, "Alice")]))
            .await
            .unwrap();

        let err = db
            .commit(&s1, commit_request(t1.id, vec![singer(2, "Bob")]))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Aborted);
        assert_eq!(db.row("Singers", &vec![Value::Integer(2)]), None);
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let db = db();
        db.seed("Singers", vec![vec![Value::Integer(1), Value::Text("old".into())]])
            .unwrap();
        let s = session(&db).await;
        let txn = db.begin_transaction(&s, begin_request(RW)).await.unwrap();
        let mutations = vec![
            Mutation::Delete {
                table: "Singers".into(),
                key_set: KeySet::key(vec![Value::Integer(1)]),
            },
            Mutation::Insert(Write {
                table: "Singers".into(),
                columns: vec!["SingerId".into(), "Name".into()],
                values: vec![vec![Value::Integer(1), Value::Text("new".into())]],
            }),
        ];
        let response = db.commit(&s, commit_request(txn.id, mutations)).await.unwrap();
        assert_eq!(response.stats, Some(CommitStats { mutation_count: 2 }));
        assert_eq!(
            db.row("Singers", &vec![Value::Integer(1)]),
            Some(vec![Value::Integer(1), Value::Text("new".into())])
        );
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let db = db();
        db.seed("Singers", vec![vec![Value::Integer(1), Value::Text("a".into())]])
            .unwrap();
        let s = session(&db).await;
        let txn = db.begin_transaction(&s, begin_request(RW)).await.unwrap();
        let mutations = vec![
            singer(5, "e"),
            Mutation::Insert(Write {
                table: "Singers".into(),
                columns: vec!["SingerId".into(), "Name".into()],
                values: vec![vec![Value::Integer(1), Value::Text("dup".into())]],
            }),
        ];
        let err = db.commit(&s, commit_request(txn.id, mutations)).await.unwrap_err();
        assert_eq!(err.code, Code::AlreadyExists);
        assert_eq!(db.row("Singers", &vec![Value::Integer(5)]), None);
    }

    #[tokio::test]
    async fn test_snapshot_reads_ignore_later_commits() {
        let db = db();
        db.seed("Singers", vec![vec![Value::Integer(1), Value::Text("a".into())]])
            .unwrap();
        let s = session(&db).await;
        let ro = db
            .begin_transaction(&s, begin_request(TransactionMode::ReadOnly(TimestampBound::Strong)))
            .await
            .unwrap();
        assert!(ro.read_timestamp.is_some());

        db.seed("Singers", vec![vec![Value::Integer(2), Value::Text("b".into())]])
            .unwrap();

        let rows: Vec<Row> = db
            .streaming_read(&s, read_request(TransactionSelector::Id(ro.id)))
            .await
            .unwrap()
            .rows
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_reports_not_found() {
        let db = db();
        let s = session(&db).await;
        db.expire_session(&s);
        let err = db.begin_transaction(&s, begin_request(RW)).await.unwrap_err();
        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let db = db();
        let s = session(&db).await;
        db.inject_failure(Method::ExecuteStreamingSql, Status::new(Code::Internal, "boom"));
        let request = || ExecuteSqlRequest {
            statement: Statement::new("SELECT 1"),
            transaction: TransactionSelector::SingleUse(TransactionMode::ReadOnly(TimestampBound::Strong)),
            partition_token: None,
            seqno: 0,
            request_options: RequestOptions::default(),
        };
        assert!(db.execute_streaming_sql(&s, request()).await.is_err());
        assert!(db.execute_streaming_sql(&s, request()).await.is_ok());
        assert_eq!(db.call_count(Method::ExecuteStreamingSql), 2);
    }

    #[tokio::test]
    async fn test_partitioned_dml_commits_on_execute() {
        let db = db();
        let s = session(&db).await;
        let sql = "UPDATE Singers SET Name = 'x' WHERE true";
        db.register_update(sql, vec![singer(1, "x"), singer(2, "x")]);
        let update = |transaction| ExecuteSqlRequest {
            statement: Statement::new(sql),
            transaction,
            partition_token: None,
            seqno: 1,
            request_options: RequestOptions::default(),
        };

        // Partitioned DML cannot begin inline.
        let err = db
            .execute_update(&s, update(TransactionSelector::Begin(TransactionMode::PartitionedDml)))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        let txn = db
            .begin_transaction(&s, begin_request(TransactionMode::PartitionedDml))
            .await
            .unwrap();
        let result = db
            .execute_update(&s, update(TransactionSelector::Id(txn.id.clone())))
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(
            db.row("Singers", &vec![Value::Integer(2)]),
            Some(vec![Value::Integer(2), Value::Text("x".into())])
        );
        assert_eq!(db.active_transactions(), 0);

        let err = db.commit(&s, commit_request(txn.id, vec![])).await.unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[test]
    fn test_parse_select() {
        let catalog = db().catalog();
        let (table, columns) = parse_select("SELECT SingerId, Name FROM Singers", &catalog).unwrap();
        assert_eq!(table, "Singers");
        assert_eq!(columns, vec!["SingerId".to_string(), "Name".to_string()]);

        let (_, all) = parse_select("select * from Singers", &catalog).unwrap();
        assert_eq!(all.len(), 2);

        assert!(parse_select("DELETE FROM Singers", &catalog).is_err());
    }
}
