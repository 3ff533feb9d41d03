use crate::core::{DbError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Multiplexed sessions are recycled by the server after this long.
pub const MAX_MULTIPLEXED_REFRESH: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Database resource path
///
/// Format: `projects/{project}/instances/{instance}/databases/{database}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabasePath {
    pub project: String,
    pub instance: String,
    pub database: String,
}

impl DatabasePath {
    pub fn new(project: &str, instance: &str, database: &str) -> Self {
        Self {
            project: project.to_string(),
            instance: instance.to_string(),
            database: database.to_string(),
        }
    }
}

impl FromStr for DatabasePath {
    type Err = DbError;

    fn from_str(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["projects", project, "instances", instance, "databases", database]
                if !project.is_empty() && !instance.is_empty() && !database.is_empty() =>
            {
                Ok(Self::new(project, instance, database))
            }
            _ => Err(DbError::InvalidConfig(format!(
                "invalid database path '{}': expected projects/<p>/instances/<i>/databases/<d>",
                path
            ))),
        }
    }
}

impl fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project, self.instance, self.database
        )
    }
}

impl Serialize for DatabasePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatabasePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Session pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sessions kept open at all times
    pub min_sessions: usize,

    /// Hard ceiling on dedicated sessions
    pub max_sessions: usize,

    /// Idle sessions kept beyond `min_sessions` during eviction
    pub max_idle: usize,

    /// How long `acquire` waits for a free session; `None` waits forever
    #[serde(rename = "acquire_timeout_ms", with = "option_ms")]
    pub acquire_timeout: Option<Duration>,

    /// Fail immediately instead of waiting when the pool is exhausted
    pub fail_fast: bool,

    /// Idle sessions older than this are evicted
    #[serde(rename = "idle_timeout_seconds", with = "secs")]
    pub idle_timeout: Duration,

    /// Idle sessions older than this are pinged
    #[serde(rename = "keep_alive_interval_seconds", with = "secs")]
    pub keep_alive_interval: Duration,

    /// Tick of the background maintenance task
    #[serde(rename = "maintenance_interval_seconds", with = "secs")]
    pub maintenance_interval: Duration,

    /// Age at which the multiplexed session is replaced
    #[serde(rename = "multiplexed_refresh_seconds", with = "secs")]
    pub multiplexed_refresh: Duration,

    /// Fine-grained access control role for new sessions
    pub database_role: Option<String>,

    /// Labels attached to new sessions
    pub labels: BTreeMap<String, String>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 100,
            max_idle: 1,
            acquire_timeout: Some(Duration::from_secs(30)),
            fail_fast: false,
            idle_timeout: Duration::from_secs(600),        // 10 minutes
            keep_alive_interval: Duration::from_secs(1800), // 30 minutes
            maintenance_interval: Duration::from_secs(60),
            multiplexed_refresh: MAX_MULTIPLEXED_REFRESH,
            database_role: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set minimum sessions
    pub fn min_sessions(mut self, min: usize) -> Self {
        self.min_sessions = min;
        self
    }

    /// Set maximum sessions
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Wait for a session indefinitely
    pub fn wait_forever(mut self) -> Self {
        self.acquire_timeout = None;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn multiplexed_refresh(mut self, refresh: Duration) -> Self {
        self.multiplexed_refresh = refresh;
        self
    }

    pub fn database_role(mut self, role: &str) -> Self {
        self.database_role = Some(role.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(DbError::InvalidConfig("max_sessions must be > 0".into()));
        }

        if self.min_sessions > self.max_sessions {
            return Err(DbError::InvalidConfig(
                "min_sessions cannot exceed max_sessions".into(),
            ));
        }

        if self.maintenance_interval.is_zero() {
            return Err(DbError::InvalidConfig(
                "maintenance_interval must be > 0".into(),
            ));
        }

        if self.multiplexed_refresh > MAX_MULTIPLEXED_REFRESH {
            return Err(DbError::InvalidConfig(
                "multiplexed_refresh cannot exceed 7 days".into(),
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod option_ms {
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
