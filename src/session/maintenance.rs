use super::pool::PoolInner;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background task running pool maintenance on a fixed tick.
///
/// Holds the pool weakly: dropping the pool ends the loop on the next tick.
pub(crate) struct Maintainer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Maintainer {
    pub(crate) fn spawn(pool: Weak<PoolInner>, tick: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(pool, tick, rx));
        Self { shutdown, task }
    }

    /// Stops the loop and waits for an in-flight round to finish.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await
            && err.is_panic()
        {
            warn!("session pool maintenance task panicked");
        }
    }
}

async fn run_loop(pool: Weak<PoolInner>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; open() has just filled the pool.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.run_maintenance().await;
    }

    debug!("session pool maintenance stopped");
}
