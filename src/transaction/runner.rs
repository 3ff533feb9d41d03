// ============================================================================
// Transaction Runner
// ============================================================================
//
// Leases a session once, then loops begin -> caller work -> commit. An
// ABORTED anywhere in an attempt discards that attempt's context and the
// whole unit of work runs again on the same session after a backoff. Every
// other error ends the run. The overall deadline covers leasing, all
// attempts and the sleeps between them.
//
// ============================================================================

use super::context::{TransactionContext, settle};
use super::options::{RequestOptions, RetrySettings, TransactionOptions};
use crate::core::{Catalog, Code, DbError, Phase, Result, Status};
use crate::rpc::CommitStats;
use crate::session::{Lease, SessionPool};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Exponential backoff with jitter:
/// `min(max_delay, base_delay * 2^attempt) * uniform(0.5, 1.5)`.
pub fn backoff(settings: &RetrySettings, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let capped = settings
        .base_delay
        .saturating_mul(factor)
        .min(settings.max_delay);
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter)
}

/// Retry bookkeeping for one run of a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// Attempts started so far.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub cumulative_delay: Duration,
    pub deadline: Instant,
}

impl RetryState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            attempts: 0,
            cumulative_delay: Duration::ZERO,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Delay before the next attempt. A server hint wins over backoff.
    pub fn next_delay(&self, settings: &RetrySettings, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| backoff(settings, self.attempts.saturating_sub(1)))
    }
}

/// Outcome of a committed unit of work.
#[derive(Debug, Clone)]
pub struct CommitResult<T> {
    pub value: T,
    pub commit_timestamp: DateTime<Utc>,
    pub stats: Option<CommitStats>,
    /// Attempts it took, including the one that committed.
    pub attempts: u32,
}

/// Runs units of work in read-write transactions, retrying on ABORTED.
pub struct TransactionRunner {
    pool: Arc<SessionPool>,
    options: TransactionOptions,
    request_options: RequestOptions,
    catalog: Option<Arc<Catalog>>,
}

impl TransactionRunner {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            options: TransactionOptions::default(),
            request_options: RequestOptions::default(),
            catalog: None,
        }
    }

    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.request_options = options;
        self
    }

    /// Validate buffered mutations against this catalog.
    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run `work` until it commits, fails with a non-retryable error, or the
    /// transaction timeout elapses.
    ///
    /// `work` receives a fresh [`TransactionContext`] per attempt and may be
    /// called several times; side effects outside the context are not undone.
    #[instrument(skip(self, work), fields(timeout_ms = self.options.timeout.as_millis() as u64))]
    pub async fn run<T, F, Fut>(&self, mut work: F) -> Result<CommitResult<T>>
    where
        F: FnMut(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.options.validate()?;
        let mut retry = RetryState::new(self.options.timeout);

        let lease = match tokio::time::timeout_at(
            retry.deadline,
            self.pool.acquire(self.options.session_kind),
        )
        .await
        {
            Ok(lease) => lease?,
            Err(_) => {
                return Err(DbError::DeadlineExceeded {
                    attempts: 0,
                    last: Box::new(DbError::PoolExhausted(
                        "transaction deadline elapsed while waiting for a session".into(),
                    )),
                });
            }
        };

        let mut last_error: Option<DbError> = None;
        loop {
            let context = TransactionContext::new(
                &lease,
                &self.options,
                &self.request_options,
                self.catalog.clone(),
                retry.attempts,
            );
            retry.attempts += 1;

            let outcome =
                tokio::time::timeout_at(retry.deadline, attempt(&context, &mut work)).await;

            let err = match outcome {
                Ok(Ok((value, response))) => {
                    lease.release();
                    if retry.attempts > 1 {
                        info!(attempts = retry.attempts, "transaction committed after retry");
                    } else {
                        debug!("transaction committed");
                    }
                    return Ok(CommitResult {
                        value,
                        commit_timestamp: response.commit_timestamp,
                        stats: response.stats,
                        attempts: retry.attempts,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    // The attempt future was dropped mid-flight.
                    rollback_in_background(context, lease);
                    let last = last_error.unwrap_or_else(|| DbError::Rpc {
                        phase: Phase::Running,
                        status: Status::new(Code::DeadlineExceeded, "transaction timeout elapsed"),
                    });
                    return Err(DbError::DeadlineExceeded {
                        attempts: retry.attempts,
                        last: Box::new(last),
                    });
                }
            };

            if err.is_aborted() {
                context.finish();
                let delay = retry.next_delay(&self.options.retry, err.retry_delay());
                if delay >= retry.remaining() {
                    warn!(attempts = retry.attempts, error = %err, "transaction deadline exceeded");
                    lease.release();
                    return Err(DbError::DeadlineExceeded {
                        attempts: retry.attempts,
                        last: Box::new(err),
                    });
                }
                warn!(
                    attempt = retry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transaction aborted; retrying"
                );
                tokio::time::sleep(delay).await;
                retry.cumulative_delay += delay;
                last_error = Some(err);
                continue;
            }

            if !err.is_session_broken() {
                context.rollback().await;
            } else {
                context.finish();
            }
            settle(lease, &err);
            return Err(err);
        }
    }
}

/// begin -> work -> commit for one attempt.
async fn attempt<T, F, Fut>(
    context: &TransactionContext,
    work: &mut F,
) -> Result<(T, crate::rpc::CommitResponse)>
where
    F: FnMut(TransactionContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    context.begin().await?;
    let value = work(context.clone()).await?;
    let response = context.commit().await?;
    Ok((value, response))
}

/// Rolls back on a spawned task that keeps the lease until the rollback is
/// done, so the next holder never shares the session with it.
fn rollback_in_background(context: TransactionContext, lease: Lease) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                context.rollback().await;
                lease.release();
            });
        }
        Err(_) => {
            context.finish();
            lease.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let settings = RetrySettings {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        for _ in 0..50 {
            let first = backoff(&settings, 0);
            assert!(first >= Duration::from_millis(5) && first <= Duration::from_millis(15));

            let third = backoff(&settings, 2);
            assert!(third >= Duration::from_millis(20) && third <= Duration::from_millis(60));

            // Capped before jitter.
            let late = backoff(&settings, 20);
            assert!(late >= Duration::from_millis(50) && late <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_backoff_saturates() {
        let settings = RetrySettings::default();
        let delay = backoff(&settings, u32::MAX);
        assert!(delay <= settings.max_delay.mul_f64(1.5));
    }

    #[test]
    fn test_server_hint_overrides_backoff() {
        let mut retry = RetryState::new(Duration::from_secs(1));
        retry.attempts = 3;
        let hint = Duration::from_millis(7);
        assert_eq!(retry.next_delay(&RetrySettings::default(), Some(hint)), hint);
    }

    #[tokio::test]
    async fn test_retry_state_remaining() {
        let retry = RetryState::new(Duration::from_secs(10));
        assert!(retry.remaining() <= Duration::from_secs(10));
        assert!(retry.remaining() > Duration::from_secs(9));
        assert_eq!(retry.attempts, 0);
        assert_eq!(retry.cumulative_delay, Duration::ZERO);
    }
}
