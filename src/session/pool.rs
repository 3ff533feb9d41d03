use super::maintenance::Maintainer;
use super::{PoolConfig, SessionHandle, SessionRole};
use crate::core::{DbError, Phase, Result};
use crate::rpc::{
    self, CreateSessionRequest, DatabaseRpc, ExecuteSqlRequest, SessionName, Statement,
    TransactionSelector,
};
use crate::transaction::options::{RequestOptions, SessionKind, TimestampBound, TransactionMode};
use futures::StreamExt;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Session pool
///
/// Bounds the number of live dedicated sessions, hands them out under
/// [`Lease`], and shares a single lazily created multiplexed session.
/// All bookkeeping sits behind one mutex that is never held across an
/// `.await`; session creation, pings and deletes run outside it.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    maintainer: tokio::sync::Mutex<Option<Maintainer>>,
}

pub(crate) struct PoolInner {
    rpc: Arc<dyn DatabaseRpc>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// One permit per dedicated session; waiters queue in FIFO order.
    permits: Arc<Semaphore>,
    /// Serializes creation of the multiplexed session.
    mux_gate: tokio::sync::Mutex<()>,
}

struct IdleSession {
    handle: Arc<SessionHandle>,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Most recently released at the end.
    idle: Vec<IdleSession>,
    leases: HashMap<Uuid, Arc<SessionHandle>>,
    /// idle + leased + being pinged + being created
    total: usize,
    creating: usize,
    multiplexed: Option<Arc<SessionHandle>>,
    closed: bool,
}

/// A slot counted in `total` for a session that does not exist yet.
/// Dropping it un-counts the slot, so a cancelled creation cannot leak.
struct Reservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    fn new(pool: &Arc<PoolInner>, state: &mut PoolState) -> Self {
        state.total += 1;
        state.creating += 1;
        Self {
            pool: Arc::clone(pool),
            armed: true,
        }
    }

    /// The slot now belongs to a live session.
    fn complete(mut self, state: &mut PoolState) {
        state.creating -= 1;
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock_state();
            state.creating -= 1;
            state.total -= 1;
        }
    }
}

impl SessionPool {
    /// Open the pool: validate the config, create `min_sessions` sessions and
    /// start background maintenance.
    #[instrument(skip(rpc, config), fields(database = %rpc.database()))]
    pub async fn open(rpc: Arc<dyn DatabaseRpc>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            rpc,
            config,
            state: Mutex::new(PoolState::default()),
            mux_gate: tokio::sync::Mutex::new(()),
        });

        if let Err(err) = inner.fill().await {
            inner.shutdown_sessions().await;
            return Err(err);
        }

        let maintainer = Maintainer::spawn(
            Arc::downgrade(&inner),
            inner.config.maintenance_interval,
        );

        info!(
            min_sessions = inner.config.min_sessions,
            max_sessions = inner.config.max_sessions,
            "session pool opened"
        );

        Ok(Self {
            inner,
            maintainer: tokio::sync::Mutex::new(Some(maintainer)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn rpc(&self) -> &Arc<dyn DatabaseRpc> {
        &self.inner.rpc
    }

    /// Acquire a session, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(&self, kind: SessionKind) -> Result<Lease> {
        self.acquire_within(kind, self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a session, waiting up to `timeout` (`None` waits forever).
    ///
    /// Multiplexed acquires never wait on the dedicated limit.
    #[instrument(skip(self))]
    pub async fn acquire_within(&self, kind: SessionKind, timeout: Option<Duration>) -> Result<Lease> {
        match kind {
            SessionKind::Dedicated => self.inner.acquire_dedicated(timeout).await,
            SessionKind::Multiplexed => self.inner.acquire_multiplexed().await,
        }
    }

    /// Return a lease to the pool. Same as dropping it.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    /// Discard the session behind a lease instead of returning it.
    pub fn invalidate(&self, lease: Lease, reason: &str) {
        lease.invalidate(reason);
    }

    /// One round of eviction, keep-alive, multiplexed refresh and refill.
    ///
    /// The background task calls this every `maintenance_interval`.
    pub async fn run_maintenance(&self) {
        self.inner.run_maintenance().await;
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Close the pool.
    ///
    /// Queued and future acquires fail with [`DbError::PoolClosed`]; idle
    /// sessions are deleted now, leased ones when their lease is released.
    #[instrument(skip(self))]
    pub async fn close(&self) -> PoolStats {
        if let Some(maintainer) = self.maintainer.lock().await.take() {
            maintainer.shutdown().await;
        }

        self.inner.permits.close();
        self.inner.shutdown_sessions().await;

        let stats = self.inner.stats();
        if stats.leased_sessions > 0 {
            warn!(
                outstanding = stats.leased_sessions,
                "session pool closed with leases still outstanding"
            );
        } else {
            info!("session pool closed");
        }
        stats
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Nothing panics while holding the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire_dedicated(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Lease> {
        if self.lock_state().closed {
            return Err(DbError::PoolClosed);
        }

        let permit = self.acquire_permit(timeout).await?;

        let reservation = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if let Some(idle) = state.idle.pop() {
                let lease_id = Uuid::new_v4();
                state.leases.insert(lease_id, Arc::clone(&idle.handle));
                return Ok(Lease::new(
                    idle.handle,
                    lease_id,
                    LeaseKind::Dedicated(permit),
                    Arc::clone(self),
                ));
            }
            // Holding a permit guarantees total < max_sessions here.
            Reservation::new(self, &mut state)
        };

        let handle = self.create_session(false).await?;

        let mut state = self.lock_state();
        reservation.complete(&mut state);
        if state.closed {
            state.total -= 1;
            drop(state);
            self.destroy_in_background(handle);
            return Err(DbError::PoolClosed);
        }
        let lease_id = Uuid::new_v4();
        state.leases.insert(lease_id, Arc::clone(&handle));
        drop(state);

        Ok(Lease::new(
            handle,
            lease_id,
            LeaseKind::Dedicated(permit),
            Arc::clone(self),
        ))
    }

    async fn acquire_permit(&self, timeout: Option<Duration>) -> Result<OwnedSemaphorePermit> {
        let max = self.config.max_sessions;

        if self.config.fail_fast {
            return match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::Closed) => Err(DbError::PoolClosed),
                Err(TryAcquireError::NoPermits) => Err(DbError::PoolExhausted(format!(
                    "no session available (max_sessions={})",
                    max
                ))),
            };
        }

        let acquire = Arc::clone(&self.permits).acquire_owned();
        let acquired = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                DbError::PoolExhausted(format!(
                    "timed out after {}ms waiting for a session (max_sessions={})",
                    timeout.as_millis(),
                    max
                ))
            })?,
            None => acquire.await,
        };
        acquired.map_err(|_| DbError::PoolClosed)
    }

    async fn acquire_multiplexed(self: &Arc<Self>) -> Result<Lease> {
        if let Some(handle) = self.current_multiplexed()? {
            return Ok(Lease::multiplexed(handle, Arc::clone(self)));
        }

        let _gate = self.mux_gate.lock().await;
        if let Some(handle) = self.current_multiplexed()? {
            return Ok(Lease::multiplexed(handle, Arc::clone(self)));
        }

        let handle = self.create_session(true).await?;
        {
            let mut state = self.lock_state();
            if state.closed {
                drop(state);
                self.destroy_in_background(handle);
                return Err(DbError::PoolClosed);
            }
            state.multiplexed = Some(Arc::clone(&handle));
        }
        info!(session = %handle.name(), "multiplexed session created");
        Ok(Lease::multiplexed(handle, Arc::clone(self)))
    }

    fn current_multiplexed(&self) -> Result<Option<Arc<SessionHandle>>> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(DbError::PoolClosed);
        }
        if let Some(stale) = state.multiplexed.take_if(|handle| !handle.is_healthy()) {
            warn!(session = %stale.name(), "multiplexed session reported gone; replacing");
        }
        Ok(state.multiplexed.clone())
    }

    async fn create_session(&self, multiplexed: bool) -> Result<Arc<SessionHandle>> {
        let request = CreateSessionRequest {
            multiplexed,
            database_role: self.config.database_role.clone(),
            labels: self.config.labels.clone(),
        };
        let info = rpc::call(
            Phase::CreateSession,
            self.rpc.default_timeout(),
            self.rpc.create_session(request),
        )
        .await?;
        debug!(session = %info.name, multiplexed, "session created");
        Ok(Arc::new(SessionHandle::from_info(info)))
    }

    /// Best-effort delete that never blocks the caller.
    fn destroy_in_background(&self, handle: Arc<SessionHandle>) {
        let rpc = Arc::clone(&self.rpc);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    delete_quietly(rpc.as_ref(), handle.name()).await;
                });
            }
            Err(_) => debug!(session = %handle.name(), "no runtime available; session left to expire"),
        }
    }

    fn settle_dedicated(&self, handle: &Arc<SessionHandle>, lease_id: Uuid, outcome: Outcome<'_>) {
        let discard = {
            let mut state = self.lock_state();
            if state.leases.remove(&lease_id).is_none() {
                warn!(%lease_id, "settled a lease the pool does not know");
                return;
            }
            let discard = matches!(outcome, Outcome::Invalidate(_))
                || state.closed
                || !handle.is_healthy();
            if discard {
                state.total -= 1;
            } else {
                state.idle.push(IdleSession {
                    handle: Arc::clone(handle),
                    last_used: Instant::now(),
                });
            }
            discard
        };

        if discard {
            if let Outcome::Invalidate(reason) = outcome {
                handle.mark_unhealthy();
                warn!(session = %handle.name(), reason, "session invalidated");
            }
            self.destroy_in_background(Arc::clone(handle));
        }
    }

    fn drop_multiplexed(&self, handle: &Arc<SessionHandle>, reason: &str) {
        handle.mark_unhealthy();
        let mut state = self.lock_state();
        if state
            .multiplexed
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            state.multiplexed = None;
            warn!(session = %handle.name(), reason, "multiplexed session invalidated");
        }
    }

    pub(crate) async fn run_maintenance(self: &Arc<Self>) {
        self.evict_idle_sessions();
        self.ping_idle_sessions().await;
        self.refresh_multiplexed().await;
        if let Err(err) = self.fill().await {
            warn!(error = %err, "failed to replenish session pool");
        }
    }

    /// Tops the pool up to `min_sessions`.
    ///
    /// Each creation holds a permit like an acquirer would, so the pool never
    /// overshoots `max_sessions` while leases are outstanding.
    async fn fill(self: &Arc<Self>) -> Result<()> {
        let reservations: Vec<(Reservation, OwnedSemaphorePermit)> = {
            let mut state = self.lock_state();
            if state.closed {
                return Ok(());
            }
            let needed = self.config.min_sessions.saturating_sub(state.total);
            let mut reservations = Vec::with_capacity(needed);
            for _ in 0..needed {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    break;
                };
                reservations.push((Reservation::new(self, &mut state), permit));
            }
            reservations
        };
        if reservations.is_empty() {
            return Ok(());
        }

        let created = join_all(reservations.iter().map(|_| self.create_session(false))).await;

        let mut first_err = None;
        let mut orphans = Vec::new();
        let mut permits = Vec::with_capacity(reservations.len());
        {
            let mut state = self.lock_state();
            let mut failed = Vec::new();
            for ((reservation, permit), result) in reservations.into_iter().zip(created) {
                permits.push(permit);
                match result {
                    Ok(handle) => {
                        reservation.complete(&mut state);
                        if state.closed {
                            state.total -= 1;
                            orphans.push(handle);
                        } else {
                            state.idle.push(IdleSession {
                                handle,
                                last_used: Instant::now(),
                            });
                        }
                    }
                    Err(err) => {
                        first_err.get_or_insert(err);
                        failed.push(reservation);
                    }
                }
            }
            drop(state);
            drop(failed);
        }
        drop(permits);

        for handle in orphans {
            self.destroy_in_background(handle);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Deletes sessions idle past `idle_timeout`, keeping `max_idle` of them
    /// and never shrinking the pool below `min_sessions`.
    fn evict_idle_sessions(&self) {
        let evicted = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let idle_timeout = self.config.idle_timeout;
            let mut stale = state
                .idle
                .iter()
                .filter(|s| s.last_used.elapsed() >= idle_timeout)
                .count();

            let mut evicted = Vec::new();
            // Oldest first.
            let mut i = 0;
            while i < state.idle.len()
                && stale > self.config.max_idle
                && state.total > self.config.min_sessions
            {
                if state.idle[i].last_used.elapsed() >= idle_timeout {
                    let session = state.idle.remove(i);
                    state.total -= 1;
                    stale -= 1;
                    evicted.push(session.handle);
                } else {
                    i += 1;
                }
            }
            evicted
        };

        for handle in evicted {
            debug!(session = %handle.name(), "evicting idle session");
            self.destroy_in_background(handle);
        }
    }

    /// Pings sessions idle longer than `keep_alive_interval` with `SELECT 1`.
    ///
    /// A session being pinged holds a permit, so acquirers never count it as
    /// available; a failed ping deletes the session.
    async fn ping_idle_sessions(&self) {
        let due: Vec<(Arc<SessionHandle>, OwnedSemaphorePermit)> = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let mut due = Vec::new();
            let mut i = 0;
            while i < state.idle.len() {
                if state.idle[i].last_used.elapsed() < self.config.keep_alive_interval {
                    i += 1;
                    continue;
                }
                match Arc::clone(&self.permits).try_acquire_owned() {
                    Ok(permit) => {
                        let session = state.idle.remove(i);
                        due.push((session.handle, permit));
                    }
                    Err(_) => break,
                }
            }
            due
        };
        if due.is_empty() {
            return;
        }

        let pings = due.into_iter().map(|(handle, permit)| async move {
            let result = self.ping(&handle).await;
            (handle, permit, result)
        });

        for (handle, permit, result) in join_all(pings).await {
            let discard = {
                let mut state = self.lock_state();
                if result.is_ok() && !state.closed {
                    state.idle.push(IdleSession {
                        handle: Arc::clone(&handle),
                        last_used: Instant::now(),
                    });
                    false
                } else {
                    state.total -= 1;
                    true
                }
            };
            if discard {
                if let Err(err) = &result {
                    warn!(session = %handle.name(), error = %err, "keep-alive failed; dropping session");
                }
                handle.mark_unhealthy();
                self.destroy_in_background(handle);
            }
            drop(permit);
        }
    }

    async fn ping(&self, handle: &SessionHandle) -> Result<()> {
        let request = ExecuteSqlRequest {
            statement: Statement::new("SELECT 1"),
            transaction: TransactionSelector::SingleUse(TransactionMode::ReadOnly(
                TimestampBound::Strong,
            )),
            partition_token: None,
            seqno: 0,
            request_options: RequestOptions::default(),
        };
        let result = rpc::call(
            Phase::Read,
            self.rpc.default_timeout(),
            self.rpc.execute_streaming_sql(handle.name(), request),
        )
        .await?;

        let mut rows = result.rows;
        while let Some(row) = rows.next().await {
            row.map_err(|status| DbError::from_status(Phase::Read, status))?;
        }
        Ok(())
    }

    /// Replaces the multiplexed session once it reaches `multiplexed_refresh`.
    /// Holders of the old handle keep using it until they let go.
    async fn refresh_multiplexed(&self) {
        let current = match self.current_multiplexed() {
            Ok(Some(current)) => current,
            _ => return,
        };
        if current.age() < self.config.multiplexed_refresh {
            return;
        }

        let _gate = self.mux_gate.lock().await;
        match self.create_session(true).await {
            Ok(fresh) => {
                let mut state = self.lock_state();
                if state.closed {
                    drop(state);
                    self.destroy_in_background(fresh);
                    return;
                }
                info!(
                    old = %current.name(),
                    new = %fresh.name(),
                    "multiplexed session refreshed"
                );
                state.multiplexed = Some(fresh);
            }
            Err(err) => warn!(error = %err, "failed to refresh multiplexed session"),
        }
    }

    /// Marks the pool closed and deletes everything not currently leased.
    async fn shutdown_sessions(&self) {
        let doomed: Vec<Arc<SessionHandle>> = {
            let mut state = self.lock_state();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).map(|s| s.handle).collect();
            state.total -= idle.len();
            idle.into_iter().chain(state.multiplexed.take()).collect()
        };

        let rpc = self.rpc.as_ref();
        join_all(doomed.iter().map(|handle| delete_quietly(rpc, handle.name()))).await;
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            total_sessions: state.total,
            idle_sessions: state.idle.len(),
            leased_sessions: state.leases.len(),
            creating_sessions: state.creating,
            max_sessions: self.config.max_sessions,
            multiplexed: state.multiplexed.is_some(),
            closed: state.closed,
        }
    }
}

async fn delete_quietly(rpc: &dyn DatabaseRpc, session: &SessionName) {
    match rpc::call(Phase::Lease, rpc.default_timeout(), rpc.delete_session(session)).await {
        Ok(()) => debug!(%session, "session deleted"),
        Err(err) => debug!(%session, error = %err, "session delete failed; ignoring"),
    }
}

/// Session pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub idle_sessions: usize,
    pub leased_sessions: usize,
    pub creating_sessions: usize,
    pub max_sessions: usize,
    pub multiplexed: bool,
    pub closed: bool,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} leased, {} idle, {} creating, max {}{}",
            self.leased_sessions,
            self.total_sessions,
            self.idle_sessions,
            self.creating_sessions,
            self.max_sessions,
            if self.closed { " (closed)" } else { "" }
        )
    }
}

enum LeaseKind {
    Dedicated(OwnedSemaphorePermit),
    Multiplexed,
}

enum Outcome<'a> {
    Release,
    Invalidate(&'a str),
}

/// Proof that the holder may use a session.
///
/// A dedicated lease is exclusive; a multiplexed lease is shared. The lease
/// settles exactly once: explicitly through [`Lease::release`] or
/// [`Lease::invalidate`], or on drop (including unwinding), which releases.
pub struct Lease {
    handle: Arc<SessionHandle>,
    lease_id: Uuid,
    acquired_at: Instant,
    kind: Option<LeaseKind>,
    pool: Arc<PoolInner>,
}

impl Lease {
    fn new(
        handle: Arc<SessionHandle>,
        lease_id: Uuid,
        kind: LeaseKind,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            handle,
            lease_id,
            acquired_at: Instant::now(),
            kind: Some(kind),
            pool,
        }
    }

    fn multiplexed(handle: Arc<SessionHandle>, pool: Arc<PoolInner>) -> Self {
        Self::new(handle, Uuid::new_v4(), LeaseKind::Multiplexed, pool)
    }

    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn name(&self) -> &SessionName {
        self.handle.name()
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn role(&self) -> SessionRole {
        self.handle.role()
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn DatabaseRpc> {
        &self.pool.rpc
    }

    /// Return the session to the idle set. No-op for multiplexed leases.
    pub fn release(mut self) {
        self.settle(Outcome::Release);
    }

    /// Drop the session from the pool; a replacement is created on demand.
    pub fn invalidate(mut self, reason: &str) {
        self.settle(Outcome::Invalidate(reason));
    }

    fn settle(&mut self, outcome: Outcome<'_>) {
        // A statement on this session already saw it was gone.
        let outcome = match outcome {
            Outcome::Release if !self.handle.is_healthy() => {
                Outcome::Invalidate("session reported not found")
            }
            outcome => outcome,
        };
        match self.kind.take() {
            Some(LeaseKind::Dedicated(permit)) => {
                self.pool.settle_dedicated(&self.handle, self.lease_id, outcome);
                // The session is back in the idle set before the next waiter wakes.
                drop(permit);
            }
            Some(LeaseKind::Multiplexed) => {
                if let Outcome::Invalidate(reason) = outcome {
                    self.pool.drop_multiplexed(&self.handle, reason);
                }
            }
            None => {}
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.settle(Outcome::Release);
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("database", self.inner.rpc.database())
            .field("stats", &self.inner.stats())
            .finish()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("session", self.handle.name())
            .field("lease_id", &self.lease_id)
            .field("role", &self.handle.role())
            .finish()
    }
}
