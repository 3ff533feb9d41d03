// ============================================================================
// Transaction Module
// ============================================================================
//
// Read-write units of work with automatic ABORTED retry, the buffered
// mutations they commit, and read-only snapshots.
//
// ============================================================================

pub mod context;
pub mod mutation;
pub mod options;
pub mod runner;

pub use context::{LeasedTransaction, Snapshot, TransactionContext};
pub use mutation::{KeyRange, KeySet, Mutation, MutationBuffer, Write};
pub use options::{
    BeginMode, IsolationLevel, Priority, ReadLockMode, RequestOptions, RetrySettings,
    SessionKind, TimestampBound, TransactionMode, TransactionOptions,
};
pub use runner::{CommitResult, RetryState, TransactionRunner, backoff};
