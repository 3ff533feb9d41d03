use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Canonical status codes reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// A failed RPC as reported by the transport.
///
/// `retry_delay` carries the server's retry hint, if it sent one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub retry_delay: Option<Duration>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_delay: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn is_session_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.contains("Session not found")
    }

    pub fn is_database_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.contains("Database not found")
    }
}

/// The stage of an operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    CreateSession,
    Lease,
    Begin,
    Running,
    Commit,
    Rollback,
    Read,
    Partition,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateSession => "create session",
            Self::Lease => "lease",
            Self::Begin => "begin",
            Self::Running => "running",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Read => "read",
            Self::Partition => "partition",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Session pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Session creation denied: {0}")]
    CreateSessionDenied(Status),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("{phase} failed: {status}")]
    Rpc { phase: Phase, status: Status },

    #[error("Deadline for transaction exceeded after {attempts} attempt(s): {last}")]
    DeadlineExceeded { attempts: u32, last: Box<DbError> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Maps a transport failure onto the engine taxonomy.
    pub fn from_status(phase: Phase, status: Status) -> Self {
        if status.is_session_not_found() {
            return Self::SessionNotFound(resource_after(&status.message, "Session not found"));
        }
        if status.is_database_not_found() {
            return Self::DatabaseNotFound(resource_after(&status.message, "Database not found"));
        }
        match (phase, status.code) {
            (Phase::CreateSession, Code::Aborted) => Self::Rpc { phase, status },
            (Phase::CreateSession, _) => Self::CreateSessionDenied(status),
            _ => Self::Rpc { phase, status },
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc { status, .. } | Self::CreateSessionDenied(status) => Some(status),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Rpc { phase, .. } => Some(*phase),
            Self::CreateSessionDenied(_) => Some(Phase::CreateSession),
            Self::PoolExhausted(_) | Self::PoolClosed => Some(Phase::Lease),
            _ => None,
        }
    }

    /// True when the server rejected the transaction because of a conflict.
    pub fn is_aborted(&self) -> bool {
        matches!(self.status(), Some(status) if status.code == Code::Aborted)
    }

    /// True when the session behind the error can no longer be used.
    pub fn is_session_broken(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::DatabaseNotFound(_))
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.status().and_then(|status| status.retry_delay)
    }
}

/// The resource named after `marker` in a server message, or the whole message.
fn resource_after(message: &str, marker: &str) -> String {
    message
        .split_once(marker)
        .map(|(_, rest)| rest.trim_start_matches(':').trim())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(message)
        .to_string()
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::ExecutionError(format!("lock poisoned: {}", err))
    }
}
