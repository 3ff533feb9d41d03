use crate::core::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound the server accepts for `max_commit_delay`.
pub const MAX_COMMIT_DELAY_LIMIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    Serializable,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadLockMode {
    #[default]
    Unspecified,
    Pessimistic,
    Optimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Unspecified,
    Low,
    Medium,
    High,
}

/// How a read-write attempt starts its server-side transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeginMode {
    /// Issue `BeginTransaction` before running the unit of work.
    #[default]
    Explicit,
    /// Piggyback the begin on the first statement of the attempt.
    Inline,
}

/// Which kind of session a unit of work runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Dedicated,
    Multiplexed,
}

/// Read timestamp selection for read-only work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampBound {
    #[default]
    Strong,
    ExactStaleness(Duration),
    ReadTimestamp(DateTime<Utc>),
}

/// Transaction flavour sent to the server with begin/commit/read requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadWrite {
        isolation_level: IsolationLevel,
        read_lock_mode: ReadLockMode,
    },
    ReadOnly(TimestampBound),
    /// Runs one DML statement in independently committed partitions.
    /// Must be begun explicitly and is never committed by the client.
    PartitionedDml,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    pub fn is_read_write(&self) -> bool {
        matches!(self, Self::ReadWrite { .. })
    }
}

/// Backoff applied between aborted attempts.
///
/// `delay = min(max_delay, base_delay * 2^attempt) * uniform(0.5, 1.5)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(32),
        }
    }
}

/// Options for one read-write unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    pub read_lock_mode: ReadLockMode,
    /// Wall-clock budget for all attempts together.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(rename = "max_commit_delay_ms", with = "option_duration_ms")]
    pub max_commit_delay: Option<Duration>,
    pub return_commit_stats: bool,
    pub begin_mode: BeginMode,
    pub session_kind: SessionKind,
    pub transaction_tag: Option<String>,
    pub exclude_from_change_streams: bool,
    pub retry: RetrySettings,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Unspecified,
            read_lock_mode: ReadLockMode::Unspecified,
            timeout: Duration::from_secs(3600),
            max_commit_delay: None,
            return_commit_stats: false,
            begin_mode: BeginMode::Explicit,
            session_kind: SessionKind::Dedicated,
            transaction_tag: None,
            exclude_from_change_streams: false,
            retry: RetrySettings::default(),
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn read_lock_mode(mut self, mode: ReadLockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_commit_delay(mut self, delay: Duration) -> Self {
        self.max_commit_delay = Some(delay);
        self
    }

    pub fn return_commit_stats(mut self, enabled: bool) -> Self {
        self.return_commit_stats = enabled;
        self
    }

    pub fn begin_mode(mut self, mode: BeginMode) -> Self {
        self.begin_mode = mode;
        self
    }

    pub fn session_kind(mut self, kind: SessionKind) -> Self {
        self.session_kind = kind;
        self
    }

    pub fn transaction_tag(mut self, tag: &str) -> Self {
        self.transaction_tag = Some(tag.to_string());
        self
    }

    pub fn exclude_from_change_streams(mut self, exclude: bool) -> Self {
        self.exclude_from_change_streams = exclude;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn mode(&self) -> TransactionMode {
        TransactionMode::ReadWrite {
            isolation_level: self.isolation_level,
            read_lock_mode: self.read_lock_mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(DbError::InvalidConfig("transaction timeout must be > 0".into()));
        }
        if let Some(delay) = self.max_commit_delay
            && delay > MAX_COMMIT_DELAY_LIMIT
        {
            return Err(DbError::InvalidConfig(format!(
                "max_commit_delay must be at most {}ms, got {}ms",
                MAX_COMMIT_DELAY_LIMIT.as_millis(),
                delay.as_millis()
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(DbError::InvalidConfig(
                "retry base_delay cannot exceed max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Per-request options forwarded to every RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub priority: Priority,
    pub request_tag: Option<String>,
    #[serde(rename = "timeout_ms", with = "option_duration_ms")]
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn request_tag(mut self, tag: &str) -> Self {
        self.request_tag = Some(tag.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The per-call timeout, never longer than the transport's own default.
    pub fn effective_timeout(&self, transport_default: Duration) -> Duration {
        match self.timeout {
            Some(timeout) => timeout.min(transport_default),
            None => transport_default,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
