pub mod config;
mod maintenance;
pub mod pool;

use crate::rpc::{SessionInfo, SessionName};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub use config::{DatabasePath, PoolConfig};
pub use pool::{Lease, PoolStats, SessionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Leased to one holder at a time.
    Dedicated,
    /// Shared by many concurrent holders; the server serializes access.
    Multiplexed,
}

/// Client-side identity of one server-side session.
///
/// Everything except the health flag is fixed at creation. Idle bookkeeping
/// (`last_used`) lives in the pool, which owns the handle.
#[derive(Debug)]
pub struct SessionHandle {
    name: SessionName,
    role: SessionRole,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    healthy: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn from_info(info: SessionInfo) -> Self {
        let role = if info.multiplexed {
            SessionRole::Multiplexed
        } else {
            SessionRole::Dedicated
        };
        Self {
            name: info.name,
            role,
            created_at: info.create_time,
            created_instant: Instant::now(),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the client learned about this session.
    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}
